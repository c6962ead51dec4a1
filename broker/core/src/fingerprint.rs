use md5::Md5;
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// A digest of a DER-encoded client certificate.
///
/// Legacy records carry MD5 digests. Newly recorded fingerprints are always
/// SHA-256; a matching MD5 fingerprint is upgraded in place.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Md5([u8; 16]),
    Sha256([u8; 32]),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseFingerprintError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("unexpected fingerprint length: {0} bytes")]
    Length(usize),
}

// === impl Fingerprint ===

impl Fingerprint {
    pub fn sha256(der: &[u8]) -> Self {
        Self::Sha256(Sha256::digest(der).into())
    }

    pub fn md5(der: &[u8]) -> Self {
        Self::Md5(Md5::digest(der).into())
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Md5(_))
    }

    /// Tests whether this fingerprint was computed from `der` with the same
    /// algorithm.
    ///
    /// When `fips` is set, MD5 fingerprints never match.
    pub fn matches(&self, der: &[u8], fips: bool) -> bool {
        match self {
            Self::Sha256(_) => *self == Self::sha256(der),
            Self::Md5(_) if fips => false,
            Self::Md5(_) => *self == Self::md5(der),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Md5(d) => d,
            Self::Sha256(d) => d,
        }
    }
}

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        match bytes.len() {
            16 => {
                let mut d = [0u8; 16];
                d.copy_from_slice(&bytes);
                Ok(Self::Md5(d))
            }
            32 => {
                let mut d = [0u8; 32];
                d.copy_from_slice(&bytes);
                Ok(Self::Sha256(d))
            }
            n => Err(ParseFingerprintError::Length(n)),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5(_) => write!(f, "Md5({self})"),
            Self::Sha256(_) => write!(f, "Sha256({self})"),
        }
    }
}
