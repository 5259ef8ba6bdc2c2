#![allow(dead_code)] // Test utilities - some functions may not be used in all tests

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use der::DecodePem;
use x509_cert::Certificate;

use pkcs11_xml_signer::utils::token::{
    KeyEntry, SignatureToken, SignatureValue, ToBeSigned, TokenConfig, TokenConnector, TokenError,
};
use pkcs11_xml_signer::utils::xades::DigestAlgorithm;

pub const INVOICE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<invoice xmlns=\"urn:example:invoice\" number=\"42\">\n\
  <total currency=\"EUR\">10.00</total>\n\
</invoice>\n";

#[derive(Debug)]
pub struct TestResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run the signer binary with `args` in `working_dir`.
///
/// The environment is cleared of the variables the CLI reads so the host
/// configuration cannot leak into a test.
pub fn run_cli(args: &[&str], working_dir: &Path) -> TestResult {
    let output = Command::new(env!("CARGO_BIN_EXE_pkcs11-xml-signer"))
        .args(args)
        .current_dir(working_dir)
        .env_remove("PKCS11_PIN")
        .env_remove("PKCS11_MODULE_PATH")
        .output()
        .expect("Failed to run pkcs11-xml-signer");

    TestResult {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    }
}

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture_certificate(name: &str) -> Certificate {
    let pem = fs::read_to_string(fixture_path(name)).expect("Failed to read fixture");
    Certificate::from_pem(pem.as_bytes()).expect("Failed to parse fixture certificate")
}

/// Key entry for the RSA signer issued by the example root CA.
pub fn signer_key() -> KeyEntry {
    let signer = fixture_certificate("signer.pem");
    let root = fixture_certificate("ca.pem");
    KeyEntry {
        id: vec![0x01],
        label: "signer".to_string(),
        certificate: signer.clone(),
        certificate_chain: vec![signer, root],
    }
}

/// Self-signed P-256 key, the second key on a two-key token.
pub fn ec_key() -> KeyEntry {
    let ec = fixture_certificate("ec-signer.pem");
    KeyEntry {
        id: vec![0x02],
        label: "ec-signer".to_string(),
        certificate: ec.clone(),
        certificate_chain: vec![ec],
    }
}

/// Calls observed by a [`FakeConnector`] and the tokens it hands out.
#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub releases: AtomicUsize,
    pub signs: AtomicUsize,
    pub signed_with: Mutex<Vec<Vec<u8>>>,
}

impl Counters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn signs(&self) -> usize {
        self.signs.load(Ordering::SeqCst)
    }

    /// Ids of the keys passed to `sign`, in call order.
    pub fn signed_with(&self) -> Vec<Vec<u8>> {
        self.signed_with.lock().unwrap().clone()
    }
}

/// In-memory token whose signature is the digest of the signed bytes.
pub struct FakeToken {
    counters: Arc<Counters>,
    keys: Vec<KeyEntry>,
    empty_signature: bool,
}

impl SignatureToken for FakeToken {
    fn keys(&self) -> Result<Vec<KeyEntry>, TokenError> {
        Ok(self.keys.clone())
    }

    fn sign(
        &self,
        data: &ToBeSigned,
        digest: DigestAlgorithm,
        key: &KeyEntry,
    ) -> Result<SignatureValue, TokenError> {
        self.counters.signs.fetch_add(1, Ordering::SeqCst);
        self.counters.signed_with.lock().unwrap().push(key.id.clone());
        if self.empty_signature {
            return Ok(SignatureValue(Vec::new()));
        }
        Ok(SignatureValue(digest.digest(data.as_bytes())))
    }
}

impl Drop for FakeToken {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    pub counters: Arc<Counters>,
    pub keys: Vec<KeyEntry>,
    pub empty_signature: bool,
    pub fail_connect: bool,
}

impl FakeConnector {
    pub fn new(keys: Vec<KeyEntry>) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            keys,
            empty_signature: false,
            fail_connect: false,
        }
    }
}

impl TokenConnector for FakeConnector {
    type Token = FakeToken;

    fn connect(&self, config: &TokenConfig) -> Result<FakeToken, TokenError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(TokenError::InvalidSlot {
                slot: config.slot,
                available: "0".to_string(),
            });
        }
        Ok(FakeToken {
            counters: Arc::clone(&self.counters),
            keys: self.keys.clone(),
            empty_signature: self.empty_signature,
        })
    }
}
