//! Integration tests against a real PKCS#11 provider.
//!
//! These tests set up a SoftHSM2 token for each run. Prerequisites:
//!
//! 1. Install SoftHSM2, OpenSC and OpenSSL:
//!    ```bash
//!    sudo apt-get install softhsm2 opensc openssl
//!    ```
//!
//! 2. Run the tests:
//!    ```bash
//!    cargo test --test pkcs11_integration_test
//!    ```
//!
//! Tests skip with a message when any of the tools or the SoftHSM2 module
//! is missing.

mod common;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serial_test::serial;
use tempfile::TempDir;

use common::{fixture_path, INVOICE};
use pkcs11_xml_signer::commands::sign::SignCommand;
use pkcs11_xml_signer::utils::pkcs11_devices::{Pkcs11Connector, MODULE_PATH_ENV};
use pkcs11_xml_signer::utils::token::{SignatureToken, TokenConfig, TokenConnector, TokenError};
use pkcs11_xml_signer::utils::xades::c14n;
use pkcs11_xml_signer::utils::xades::constants::DSIG_NS;

const USER_PIN: &str = "1234";
const SO_PIN: &str = "56781234";

const MODULE_CANDIDATES: &[&str] = &[
    "/usr/lib/softhsm/libsofthsm2.so",
    "/usr/lib/x86_64-linux-gnu/softhsm/libsofthsm2.so",
    "/usr/lib/aarch64-linux-gnu/softhsm/libsofthsm2.so",
    "/usr/lib64/pkcs11/libsofthsm2.so",
    "/usr/local/lib/softhsm/libsofthsm2.so",
];

/// A SoftHSM2 token in a private token directory, holding the RSA signer
/// key with its certificate and the issuing CA certificate.
struct SoftHsmInstance {
    dir: TempDir,
    module: PathBuf,
    slot: u64,
}

impl SoftHsmInstance {
    fn new(module: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let token_dir = dir.path().join("tokens");
        fs::create_dir_all(&token_dir)?;

        let conf = dir.path().join("softhsm2.conf");
        fs::write(
            &conf,
            format!(
                "directories.tokendir = {}\nobjectstore.backend = file\nlog.level = ERROR\n",
                token_dir.display()
            ),
        )?;
        // The module reads its configuration in-process, so the variable
        // must be set for the test process itself.
        env::set_var("SOFTHSM2_CONF", &conf);
        env::remove_var(MODULE_PATH_ENV);

        let output = Command::new("softhsm2-util")
            .args([
                "--init-token",
                "--free",
                "--label",
                "signer",
                "--pin",
                USER_PIN,
                "--so-pin",
                SO_PIN,
            ])
            .output()?;
        if !output.status.success() {
            return Err(format!(
                "softhsm2-util failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )
            .into());
        }
        let slot = parse_slot(&String::from_utf8_lossy(&output.stdout))
            .ok_or("Could not find the slot of the new token")?;

        let instance = Self { dir, module, slot };
        instance.import_objects()?;
        Ok(instance)
    }

    fn import_objects(&self) -> Result<(), Box<dyn std::error::Error>> {
        let key_der = self.dir.path().join("signer-key.der");
        let cert_der = self.dir.path().join("signer.der");
        let ca_der = self.dir.path().join("ca.der");

        run(Command::new("openssl")
            .args(["pkcs8", "-topk8", "-nocrypt", "-in"])
            .arg(fixture_path("signer-key.pem"))
            .args(["-outform", "DER", "-out"])
            .arg(&key_der))?;
        to_der(&fixture_path("signer.pem"), &cert_der)?;
        to_der(&fixture_path("ca.pem"), &ca_der)?;

        self.write_object(&key_der, "privkey", "01", "signer")?;
        self.write_object(&cert_der, "cert", "01", "signer")?;
        self.write_object(&ca_der, "cert", "02", "root-ca")?;
        Ok(())
    }

    fn write_object(
        &self,
        file: &Path,
        kind: &str,
        id: &str,
        label: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let slot = self.slot.to_string();
        run(Command::new("pkcs11-tool")
            .arg("--module")
            .arg(&self.module)
            .args(["--slot", slot.as_str()])
            .args(["--login", "--pin", USER_PIN, "--write-object"])
            .arg(file)
            .args(["--type", kind, "--id", id, "--label", label]))
    }

    fn config(&self, pin: &str) -> TokenConfig {
        TokenConfig {
            module_path: self.module.clone(),
            slot: self.slot,
            pin: pin.to_string(),
        }
    }
}

impl Drop for SoftHsmInstance {
    fn drop(&mut self) {
        env::remove_var("SOFTHSM2_CONF");
    }
}

fn run(command: &mut Command) -> Result<(), Box<dyn std::error::Error>> {
    let output = command.output()?;
    if !output.status.success() {
        return Err(format!(
            "{:?} failed: {}",
            command.get_program(),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

fn to_der(pem: &Path, der: &Path) -> Result<(), Box<dyn std::error::Error>> {
    run(Command::new("openssl")
        .args(["x509", "-in"])
        .arg(pem)
        .args(["-outform", "DER", "-out"])
        .arg(der))
}

/// Slot id from "The token has been initialized and is reassigned to slot N".
fn parse_slot(stdout: &str) -> Option<u64> {
    let (_, rest) = stdout.rsplit_once("to slot ")?;
    rest.split_whitespace().next()?.parse().ok()
}

fn tool_available(tool: &str, arg: &str) -> bool {
    Command::new(tool)
        .arg(arg)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// SoftHSM2 module, when it and the tools needed to populate it exist.
fn softhsm_module() -> Option<PathBuf> {
    if !tool_available("softhsm2-util", "--version") {
        eprintln!("softhsm2-util not available, skipping test. Install: sudo apt install softhsm2");
        return None;
    }
    if !tool_available("pkcs11-tool", "--help") {
        eprintln!("pkcs11-tool not available, skipping test. Install: sudo apt install opensc");
        return None;
    }
    if !tool_available("openssl", "version") {
        eprintln!("openssl not available, skipping test");
        return None;
    }

    let module = env::var("SOFTHSM2_MODULE")
        .ok()
        .map(PathBuf::from)
        .into_iter()
        .chain(MODULE_CANDIDATES.iter().map(PathBuf::from))
        .find(|path| path.exists());
    if module.is_none() {
        eprintln!("SoftHSM2 PKCS#11 module not found, skipping test. Set SOFTHSM2_MODULE");
    }
    module
}

#[test]
fn test_parse_slot() {
    assert_eq!(
        parse_slot("The token has been initialized and is reassigned to slot 1804289383\n"),
        Some(1_804_289_383)
    );
    assert_eq!(parse_slot("Slot 0 has a free/uninitialized token."), None);
}

#[test]
#[serial]
fn test_softhsm_lists_keys_with_chain() {
    let Some(module) = softhsm_module() else {
        return;
    };
    let hsm = SoftHsmInstance::new(module).expect("Failed to set up SoftHSM2 token");

    let token = Pkcs11Connector
        .connect(&hsm.config(USER_PIN))
        .expect("Failed to connect to SoftHSM2 token");
    let keys = token.keys().expect("Failed to list keys");

    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].label, "signer");
    assert_eq!(keys[0].id, vec![0x01]);
    assert!(keys[0].subject().contains("CN=Maria Silva"));
    assert_eq!(keys[0].certificate_chain.len(), 2);
}

#[test]
#[serial]
fn test_softhsm_wrong_pin_fails_login() {
    let Some(module) = softhsm_module() else {
        return;
    };
    let hsm = SoftHsmInstance::new(module).expect("Failed to set up SoftHSM2 token");

    match Pkcs11Connector.connect(&hsm.config("0000")) {
        Err(TokenError::Login { slot, .. }) => assert_eq!(slot, hsm.slot),
        Err(other) => panic!("Expected a login error, got {other}"),
        Ok(_) => panic!("Login with a wrong PIN succeeded"),
    }
}

#[test]
#[serial]
fn test_softhsm_unknown_slot_lists_available_slots() {
    let Some(module) = softhsm_module() else {
        return;
    };
    let hsm = SoftHsmInstance::new(module).expect("Failed to set up SoftHSM2 token");

    let mut config = hsm.config(USER_PIN);
    config.slot = hsm.slot.wrapping_add(1);
    match Pkcs11Connector.connect(&config) {
        Err(TokenError::InvalidSlot { available, .. }) => {
            assert!(available.contains(&hsm.slot.to_string()));
        }
        Err(other) => panic!("Expected an invalid slot error, got {other}"),
        Ok(_) => panic!("Connected to a slot without a token"),
    }
}

#[test]
#[serial]
fn test_softhsm_signs_xml_file() {
    let Some(module) = softhsm_module() else {
        return;
    };
    let hsm = SoftHsmInstance::new(module).expect("Failed to set up SoftHSM2 token");

    let work = TempDir::new().unwrap();
    let input = work.path().join("invoice.xml");
    fs::write(&input, INVOICE).unwrap();

    let mut cmd = SignCommand::new(input, USER_PIN.to_string());
    cmd.slot = hsm.slot;
    cmd.pkcs11_lib = hsm.module.clone();
    let output = cmd.execute().expect("Failed to sign with SoftHSM2 token");

    let signed = fs::read_to_string(&output).unwrap();
    assert_eq!(signed.matches("<ds:X509Certificate>").count(), 2);

    let start = signed.find("<ds:SignatureValue").unwrap();
    let value_start = start + signed[start..].find('>').unwrap() + 1;
    let value_end = value_start + signed[value_start..].find('<').unwrap();
    let value = STANDARD.decode(&signed[value_start..value_end]).unwrap();
    assert!(!value.is_empty());

    // The token signature must verify over the canonical SignedInfo with
    // the signer certificate's public key.
    let signed_info = c14n::canonicalize_element(&signed, DSIG_NS, "SignedInfo").unwrap();
    let signed_info_path = work.path().join("signed-info.xml");
    let signature_path = work.path().join("signature.bin");
    let public_key_path = work.path().join("signer-pub.pem");
    fs::write(&signed_info_path, signed_info).unwrap();
    fs::write(&signature_path, &value).unwrap();

    let public_key = Command::new("openssl")
        .args(["x509", "-pubkey", "-noout", "-in"])
        .arg(fixture_path("signer.pem"))
        .output()
        .unwrap();
    assert!(public_key.status.success(), "Failed to extract the signer public key");
    fs::write(&public_key_path, &public_key.stdout).unwrap();

    let verify = Command::new("openssl")
        .args(["dgst", "-sha256", "-verify"])
        .arg(&public_key_path)
        .arg("-signature")
        .arg(&signature_path)
        .arg(&signed_info_path)
        .output()
        .unwrap();
    assert!(
        verify.status.success(),
        "openssl rejected the signature: {}{}",
        String::from_utf8_lossy(&verify.stdout),
        String::from_utf8_lossy(&verify.stderr)
    );
}
