//! PKCS#11 token access for signing keys held on smartcards, HSMs and TPMs.

use std::path::{Path, PathBuf};

use cryptoki::context::{CInitializeArgs, CInitializeFlags, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use der::Decode;
use x509_cert::Certificate;

use crate::utils::certificate;
use crate::utils::output::{print_info, print_warning, OutputLevel};
use crate::utils::token::{
    KeyEntry, SignatureToken, SignatureValue, ToBeSigned, TokenConfig, TokenConnector, TokenError,
};
use crate::utils::xades::DigestAlgorithm;

/// Default provider module, OpenSC's PKCS#11 library.
pub const DEFAULT_MODULE_PATH: &str = "/usr/local/lib/opensc-pkcs11.so";

/// Environment variable read by the CLI when `--pkcs11-lib` is not given.
pub const MODULE_PATH_ENV: &str = "PKCS11_MODULE_PATH";

/// Resolve the PKCS#11 module to load.
///
/// `requested` is already the outcome of flag, environment and default
/// resolution, so it is used as given. The path must exist.
pub fn get_pkcs11_module_path(requested: &Path) -> Result<PathBuf, TokenError> {
    if !requested.exists() {
        return Err(TokenError::ModuleNotFound(requested.to_path_buf()));
    }
    Ok(requested.to_path_buf())
}

/// Find the slot with id `slot_id` among the slots holding a token.
pub fn find_slot(pkcs11: &Pkcs11, slot_id: u64) -> Result<Slot, TokenError> {
    let slots = pkcs11
        .get_slots_with_token()
        .map_err(TokenError::pkcs11("list PKCS#11 slots"))?;

    if slots.is_empty() {
        return Err(TokenError::NoToken);
    }

    if let Some(slot) = slots.iter().find(|slot| slot.id() == slot_id) {
        return Ok(*slot);
    }

    let mut available = Vec::new();
    for slot in &slots {
        match pkcs11.get_token_info(*slot) {
            Ok(info) => available.push(format!("{} ('{}')", slot.id(), info.label().trim())),
            Err(_) => available.push(slot.id().to_string()),
        }
    }
    Err(TokenError::InvalidSlot {
        slot: slot_id,
        available: available.join(", "),
    })
}

/// Connects to tokens through a PKCS#11 provider module.
#[derive(Debug, Default, Clone)]
pub struct Pkcs11Connector;

impl TokenConnector for Pkcs11Connector {
    type Token = Pkcs11Token;

    fn connect(&self, config: &TokenConfig) -> Result<Pkcs11Token, TokenError> {
        Pkcs11Token::open(config)
    }
}

/// A logged-in session on a PKCS#11 token.
///
/// Dropping the token logs out, closes the session and finalizes the
/// library.
pub struct Pkcs11Token {
    session: Session,
    _pkcs11: Pkcs11,
    slot_id: u64,
    pin: String,
}

impl Pkcs11Token {
    /// Load the module, find the slot, open a session and log in.
    pub fn open(config: &TokenConfig) -> Result<Self, TokenError> {
        let module_path = get_pkcs11_module_path(&config.module_path)?;
        print_info(
            &format!("Using PKCS#11 module {}", module_path.display()),
            OutputLevel::Verbose,
        );

        let pkcs11 = Pkcs11::new(&module_path).map_err(|source| TokenError::ModuleLoad {
            path: module_path.clone(),
            source,
        })?;
        pkcs11
            .initialize(CInitializeArgs::new(CInitializeFlags::OS_LOCKING_OK))
            .map_err(TokenError::pkcs11("initialize PKCS#11"))?;

        let slot = find_slot(&pkcs11, config.slot)?;
        let session = pkcs11
            .open_ro_session(slot)
            .map_err(TokenError::pkcs11("open PKCS#11 session"))?;

        let auth_pin = AuthPin::new(config.pin.clone().into());
        session
            .login(UserType::User, Some(&auth_pin))
            .map_err(|source| TokenError::Login {
                slot: config.slot,
                source,
            })?;

        Ok(Self {
            session,
            _pkcs11: pkcs11,
            slot_id: config.slot,
            pin: config.pin.clone(),
        })
    }

    fn attribute_bytes(
        &self,
        handle: ObjectHandle,
        kind: AttributeType,
    ) -> Result<Option<Vec<u8>>, TokenError> {
        let attrs = self
            .session
            .get_attributes(handle, &[kind])
            .map_err(TokenError::pkcs11("read object attributes"))?;

        Ok(attrs.into_iter().find_map(|attr| match attr {
            Attribute::Id(bytes) | Attribute::Label(bytes) | Attribute::Value(bytes) => Some(bytes),
            _ => None,
        }))
    }

    /// All X.509 certificates on the token, with their CKA_ID.
    fn certificates(&self) -> Result<Vec<(Vec<u8>, Certificate)>, TokenError> {
        let handles = self
            .session
            .find_objects(&[Attribute::Class(ObjectClass::CERTIFICATE)])
            .map_err(TokenError::pkcs11("find certificates"))?;

        let mut certificates = Vec::with_capacity(handles.len());
        for handle in handles {
            let id = self
                .attribute_bytes(handle, AttributeType::Id)?
                .unwrap_or_default();
            let Some(value) = self.attribute_bytes(handle, AttributeType::Value)? else {
                continue;
            };
            let label = self
                .attribute_bytes(handle, AttributeType::Label)?
                .map(|label| String::from_utf8_lossy(&label).trim().to_string())
                .unwrap_or_default();

            let certificate = Certificate::from_der(&value)
                .map_err(|source| TokenError::Certificate { label, source })?;
            certificates.push((id, certificate));
        }
        Ok(certificates)
    }

    fn private_key(&self, key: &KeyEntry) -> Result<ObjectHandle, TokenError> {
        let handles = self
            .session
            .find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Id(key.id.clone()),
            ])
            .map_err(TokenError::pkcs11("find private key"))?;

        handles
            .first()
            .copied()
            .ok_or_else(|| TokenError::KeyNotFound(key.display_name()))
    }

    /// Log in again for keys that demand authentication per operation.
    fn authenticate_for_key(&self, handle: ObjectHandle) -> Result<(), TokenError> {
        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::AlwaysAuthenticate])
            .map_err(TokenError::pkcs11("read key authentication flag"))?;
        let requires_auth = always_authenticate(attrs);

        if requires_auth {
            let auth_pin = AuthPin::new(self.pin.clone().into());
            self.session
                .login(UserType::ContextSpecific, Some(&auth_pin))
                .map_err(|source| TokenError::Login {
                    slot: self.slot_id,
                    source,
                })?;
        }
        Ok(())
    }

    fn key_type(&self, handle: ObjectHandle) -> Result<KeyType, TokenError> {
        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::KeyType])
            .map_err(TokenError::pkcs11("read key type"))?;

        attrs
            .into_iter()
            .find_map(|attr| match attr {
                Attribute::KeyType(key_type) => Some(key_type),
                _ => None,
            })
            .ok_or_else(|| TokenError::UnsupportedKeyType("unknown".to_string()))
    }
}

/// `CKA_ALWAYS_AUTHENTICATE` from an attribute read. Tokens that do not
/// know the attribute report it as unavailable, which means false.
fn always_authenticate(attrs: Vec<Attribute>) -> bool {
    attrs
        .into_iter()
        .find_map(|attr| match attr {
            Attribute::AlwaysAuthenticate(value) => Some(value),
            _ => None,
        })
        .unwrap_or(false)
}

impl SignatureToken for Pkcs11Token {
    fn keys(&self) -> Result<Vec<KeyEntry>, TokenError> {
        let certificates = self.certificates()?;
        let pool: Vec<Certificate> = certificates.iter().map(|(_, cert)| cert.clone()).collect();

        let handles = self
            .session
            .find_objects(&[Attribute::Class(ObjectClass::PRIVATE_KEY)])
            .map_err(TokenError::pkcs11("find private keys"))?;

        let mut keys = Vec::with_capacity(handles.len());
        for handle in handles {
            let id = self
                .attribute_bytes(handle, AttributeType::Id)?
                .unwrap_or_default();
            let label = self
                .attribute_bytes(handle, AttributeType::Label)?
                .map(|label| String::from_utf8_lossy(&label).trim().to_string())
                .unwrap_or_default();

            let Some((_, cert)) = certificates.iter().find(|(cert_id, _)| *cert_id == id) else {
                print_warning(&format!(
                    "Skipping private key '{}' without a matching certificate",
                    if label.is_empty() { hex::encode(&id) } else { label.clone() }
                ));
                continue;
            };

            keys.push(KeyEntry {
                id,
                label,
                certificate: cert.clone(),
                certificate_chain: certificate::build_chain(cert, &pool),
            });
        }
        Ok(keys)
    }

    fn sign(
        &self,
        data: &ToBeSigned,
        digest: DigestAlgorithm,
        key: &KeyEntry,
    ) -> Result<SignatureValue, TokenError> {
        let handle = self.private_key(key)?;
        self.authenticate_for_key(handle)?;

        let hash = digest.digest(data.as_bytes());
        let (mechanism, input) = match self.key_type(handle)? {
            KeyType::RSA => (Mechanism::RsaPkcs, digest.digest_info(&hash)),
            KeyType::EC => (Mechanism::Ecdsa, hash),
            other => return Err(TokenError::UnsupportedKeyType(other.to_string())),
        };

        let signature = self
            .session
            .sign(&mechanism, handle, &input)
            .map_err(TokenError::pkcs11("sign data with PKCS#11 token"))?;
        Ok(SignatureValue(signature))
    }
}

impl Drop for Pkcs11Token {
    fn drop(&mut self) {
        // Best effort: the session closes and the library finalizes anyway.
        let _ = self.session.logout();
    }
}
