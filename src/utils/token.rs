//! Signing token abstraction.
//!
//! A [`TokenConnector`] opens a session on a token and hands back a
//! [`SignatureToken`]. The session lives exactly as long as that value:
//! dropping it logs out and releases the session, so every exit path of a
//! signing run releases the token once without explicit close calls.

use std::fmt;
use std::path::PathBuf;

use x509_cert::Certificate;

use crate::utils::certificate;
use crate::utils::xades::DigestAlgorithm;

/// Errors raised while talking to a signing token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("PKCS#11 module '{0}' does not exist")]
    ModuleNotFound(PathBuf),
    #[error("Failed to load PKCS#11 module '{path}': {source}")]
    ModuleLoad {
        path: PathBuf,
        #[source]
        source: cryptoki::error::Error,
    },
    #[error("No PKCS#11 token present. Ensure the card is inserted in the reader")]
    NoToken,
    #[error("Slot {slot} not found or has no token. Available slots: {available}")]
    InvalidSlot { slot: u64, available: String },
    #[error("Failed to login to token in slot {slot}. Check the PIN")]
    Login {
        slot: u64,
        #[source]
        source: cryptoki::error::Error,
    },
    #[error("Key index {index} is out of range: token holds {count} key(s)")]
    KeyIndexOutOfRange { index: usize, count: usize },
    #[error("No private key matches key entry '{0}'")]
    KeyNotFound(String),
    #[error("Unsupported key type for signing: {0}")]
    UnsupportedKeyType(String),
    #[error("Certificate '{label}' on token could not be parsed: {source}")]
    Certificate {
        label: String,
        #[source]
        source: der::Error,
    },
    #[error("Failed to {action}: {source}")]
    Pkcs11 {
        action: &'static str,
        #[source]
        source: cryptoki::error::Error,
    },
}

impl TokenError {
    pub(crate) fn pkcs11(action: &'static str) -> impl FnOnce(cryptoki::error::Error) -> Self {
        move |source| TokenError::Pkcs11 { action, source }
    }
}

/// Where to find the token and how to unlock it.
#[derive(Clone)]
pub struct TokenConfig {
    /// Path to the PKCS#11 provider module.
    pub module_path: PathBuf,
    /// Slot id holding the token.
    pub slot: u64,
    /// User PIN.
    pub pin: String,
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("module_path", &self.module_path)
            .field("slot", &self.slot)
            .field("pin", &"<redacted>")
            .finish()
    }
}

/// A private key on the token together with its certificate and chain.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    /// CKA_ID shared by the private key and its certificate.
    pub id: Vec<u8>,
    /// CKA_LABEL of the private key, possibly empty.
    pub label: String,
    /// Certificate of the key.
    pub certificate: Certificate,
    /// Chain starting with `certificate`, followed by its issuers.
    pub certificate_chain: Vec<Certificate>,
}

impl KeyEntry {
    /// Name used in diagnostics: the label, or the hex id when unlabeled.
    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            hex::encode(&self.id)
        } else {
            self.label.clone()
        }
    }

    /// Subject distinguished name of the certificate.
    pub fn subject(&self) -> String {
        certificate::subject_name(&self.certificate)
    }

    /// Issuer distinguished name of the certificate.
    pub fn issuer(&self) -> String {
        certificate::issuer_name(&self.certificate)
    }
}

/// Canonical bytes handed to the token for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToBeSigned(pub Vec<u8>);

impl ToBeSigned {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Raw signature value returned by the token.
///
/// RSA values are the PKCS#1 v1.5 signature block; ECDSA values are the
/// concatenation `r || s`, which is the XML-DSig encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureValue(pub Vec<u8>);

impl SignatureValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An open session on a signing token.
///
/// Implementations release the session when dropped.
pub trait SignatureToken {
    /// Keys on the token that carry a certificate, in token order.
    fn keys(&self) -> Result<Vec<KeyEntry>, TokenError>;

    /// Sign `data` with the private key of `key`, digesting with `digest`.
    fn sign(
        &self,
        data: &ToBeSigned,
        digest: DigestAlgorithm,
        key: &KeyEntry,
    ) -> Result<SignatureValue, TokenError>;
}

/// Opens token sessions.
pub trait TokenConnector {
    type Token: SignatureToken;

    /// Load the provider, find the slot and log in.
    fn connect(&self, config: &TokenConfig) -> Result<Self::Token, TokenError>;
}

/// Pick the key at `index`, failing when the token holds fewer keys.
pub fn select_key(keys: &[KeyEntry], index: usize) -> Result<&KeyEntry, TokenError> {
    keys.get(index).ok_or(TokenError::KeyIndexOutOfRange {
        index,
        count: keys.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::DecodePem;

    fn entry(label: &str) -> KeyEntry {
        let pem = include_str!("../../tests/fixtures/signer.pem");
        let certificate = Certificate::from_pem(pem).unwrap();
        KeyEntry {
            id: vec![0x01, 0xab],
            label: label.to_string(),
            certificate: certificate.clone(),
            certificate_chain: vec![certificate],
        }
    }

    #[test]
    fn test_select_key_in_range() {
        let keys = vec![entry("first"), entry("second")];
        assert_eq!(select_key(&keys, 1).unwrap().label, "second");
    }

    #[test]
    fn test_select_key_out_of_range() {
        let keys = vec![entry("only")];
        match select_key(&keys, 1) {
            Err(TokenError::KeyIndexOutOfRange { index, count }) => {
                assert_eq!(index, 1);
                assert_eq!(count, 1);
            }
            other => panic!("Expected KeyIndexOutOfRange, got {other:?}"),
        }
        assert!(select_key(&[], 0).is_err());
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        assert_eq!(entry("").display_name(), "01ab");
        assert_eq!(entry("signing").display_name(), "signing");
    }

    #[test]
    fn test_key_entry_names() {
        let key = entry("k");
        assert!(key.subject().contains("CN=Maria Silva"));
        assert!(key.issuer().contains("CN=Example Root CA"));
    }

    #[test]
    fn test_token_config_debug_hides_pin() {
        let config = TokenConfig {
            module_path: PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"),
            slot: 3,
            pin: "123456".to_string(),
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("123456"));
        assert!(debug.contains("<redacted>"));
    }
}
