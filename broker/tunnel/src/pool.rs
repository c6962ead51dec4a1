use crate::{tls, Error};
use parking_lot::RwLock;
use rustls::{pki_types::CertificateDer, RootCertStore};
use std::{collections::HashSet, sync::Arc};

/// The set of certificates that incoming tunnel client certificates must
/// chain to.
///
/// The pool only grows: certificates are never removed for the life of the
/// process. Each append publishes a new immutable snapshot, so handshakes in
/// progress keep verifying against the store they started with.
#[derive(Debug, Default)]
pub struct CertPool {
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    generation: u64,
    roots: Arc<RootCertStore>,
    known: HashSet<Vec<u8>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            generation: 0,
            roots: Arc::new(RootCertStore::empty()),
            known: HashSet::new(),
        }
    }
}

// === impl CertPool ===

impl CertPool {
    pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
        let pool = Self::default();
        pool.append_pem(pem)?;
        Ok(pool)
    }

    /// Appends every certificate in `pem`, returning how many were new.
    pub fn append_pem(&self, pem: &[u8]) -> Result<usize, Error> {
        let mut added = 0;
        for cert in tls::load_certs(pem)? {
            if self.append(cert)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Appends a certificate, returning false if it was already present.
    pub fn append(&self, cert: CertificateDer<'static>) -> Result<bool, Error> {
        let mut inner = self.inner.write();
        if inner.known.contains(cert.as_ref()) {
            return Ok(false);
        }

        let mut roots = (*inner.roots).clone();
        roots.add(cert.clone())?;
        inner.roots = Arc::new(roots);
        inner.known.insert(cert.as_ref().to_vec());
        inner.generation += 1;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.inner.read().known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current roots, tagged with a generation that changes on every
    /// successful append.
    pub(crate) fn snapshot(&self) -> (u64, Arc<RootCertStore>) {
        let inner = self.inner.read();
        (inner.generation, inner.roots.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca_pem(name: &str) -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn grows_only_with_new_certificates() {
        let a = ca_pem("a");
        let b = ca_pem("b");

        let pool = CertPool::from_pem(a.as_bytes()).unwrap();
        let (gen0, _) = pool.snapshot();
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.append_pem(a.as_bytes()).unwrap(), 0);
        assert_eq!(pool.snapshot().0, gen0, "duplicates must not publish");

        assert_eq!(pool.append_pem(format!("{a}{b}").as_bytes()).unwrap(), 1);
        let (gen1, roots) = pool.snapshot();
        assert_ne!(gen0, gen1);
        assert_eq!(roots.len(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn rejects_garbage() {
        let pool = CertPool::default();
        assert!(pool.append_pem(b"not a pem").is_err());
        assert!(pool.is_empty());
    }
}
