use crate::Error;
use rustls::pki_types::CertificateDer;

/// The verified certificate chain a tunnel's peer presented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    chain: Vec<CertificateDer<'static>>,
}

impl Identity {
    pub fn new(chain: Vec<CertificateDer<'static>>) -> Result<Self, Error> {
        if chain.is_empty() {
            return Err(Error::NoPeerCertificate);
        }
        Ok(Self { chain })
    }

    /// The end-entity certificate.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn der(&self) -> &[u8] {
        self.certificate().as_ref()
    }

    /// The subject common name of the end-entity certificate.
    pub fn common_name(&self) -> Result<String, Error> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(self.der())
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| Error::Certificate("no common name".to_string()));
        cn
    }
}
