//! Cipher Sets
//!
//! The access keys served on one port. A port's set is replaced as a whole;
//! connections keep the snapshot they took when they were accepted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::AccessKeyConfig;
use crate::error::ConfigParseError;

/// Supported AEAD cipher identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Chacha20IetfPoly1305,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl CipherKind {
    pub const ALL: [CipherKind; 4] = [
        CipherKind::Chacha20IetfPoly1305,
        CipherKind::Aes128Gcm,
        CipherKind::Aes192Gcm,
        CipherKind::Aes256Gcm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CipherKind::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes192Gcm => "aes-192-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CipherKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| s.to_string())
    }
}

/// One access key as served on a port.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherEntry {
    pub id: String,
    pub kind: CipherKind,
    pub secret: String,
}

impl CipherEntry {
    pub fn from_config(key: &AccessKeyConfig) -> Result<Self, ConfigParseError> {
        let kind = key
            .cipher
            .parse::<CipherKind>()
            .map_err(|cipher| ConfigParseError::UnknownCipher {
                id: key.id.clone(),
                cipher,
            })?;
        Ok(Self {
            id: key.id.clone(),
            kind,
            secret: key.secret.clone(),
        })
    }
}

// Keep secrets out of logs.
impl fmt::Debug for CipherEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Shared, atomically replaceable list of a port's cipher entries.
#[derive(Debug)]
pub struct CipherSet {
    entries: ArcSwap<Vec<Arc<CipherEntry>>>,
}

impl CipherSet {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<CipherEntry>>> {
        self.entries.load_full()
    }

    pub fn replace(&self, entries: Vec<Arc<CipherEntry>>) {
        self.entries.store(Arc::new(entries));
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CipherSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, cipher: &str) -> AccessKeyConfig {
        AccessKeyConfig {
            id: id.to_string(),
            port: 9000,
            cipher: cipher.to_string(),
            secret: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_cipher_kind_parse() {
        assert_eq!("aes-128-gcm".parse::<CipherKind>(), Ok(CipherKind::Aes128Gcm));
        assert_eq!(
            "CHACHA20-IETF-POLY1305".parse::<CipherKind>(),
            Ok(CipherKind::Chacha20IetfPoly1305)
        );
        assert!("rc4-md5".parse::<CipherKind>().is_err());
    }

    #[test]
    fn test_entry_from_unknown_cipher() {
        let err = CipherEntry::from_config(&key("k1", "rc4")).unwrap_err();
        assert!(matches!(err, ConfigParseError::UnknownCipher { ref id, .. } if id == "k1"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let entry = CipherEntry::from_config(&key("k1", "aes-256-gcm")).unwrap();
        assert!(!format!("{:?}", entry).contains("s3cret"));
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let set = CipherSet::new();
        let entry = Arc::new(CipherEntry::from_config(&key("k1", "aes-256-gcm")).unwrap());
        set.replace(vec![entry]);

        let before = set.snapshot();
        set.replace(Vec::new());

        assert_eq!(before.len(), 1);
        assert!(set.is_empty());
    }
}
