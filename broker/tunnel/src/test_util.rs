//! A throwaway PKI for tests.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// A self-signed CA that issues server and client certificates.
pub struct Pki {
    issuer: Issuer<'static, KeyPair>,
    ca: Creds,
}

/// A certificate and its private key.
#[derive(Clone, Debug)]
pub struct Creds {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: Vec<u8>,
    key_der: Vec<u8>,
}

impl Pki {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().expect("key must generate");
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        let cert = params.self_signed(&key).expect("CA must self-sign");
        let ca = Creds::new(cert, &key);
        Self {
            issuer: Issuer::new(params, key),
            ca,
        }
    }

    pub fn ca(&self) -> &Creds {
        &self.ca
    }

    /// Issues a server certificate for `dns_name`.
    pub fn server(&self, dns_name: &str) -> Creds {
        let mut params =
            CertificateParams::new(vec![dns_name.to_string()]).expect("name must be valid");
        params.distinguished_name = dn(dns_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.issue(params)
    }

    /// Issues a client certificate with `common_name` as its subject CN.
    pub fn client(&self, common_name: &str) -> Creds {
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params)
    }

    fn issue(&self, params: CertificateParams) -> Creds {
        let key = KeyPair::generate().expect("key must generate");
        let cert = params
            .signed_by(&key, &self.issuer)
            .expect("certificate must be signed");
        Creds::new(cert, &key)
    }
}

fn dn(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

impl Creds {
    fn new(cert: rcgen::Certificate, key: &KeyPair) -> Self {
        Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            der: cert.der().to_vec(),
            key_der: key.serialize_der(),
        }
    }

    pub fn certs(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.der.clone())]
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}
