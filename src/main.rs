use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use pkcs11_xml_signer::commands::sign::{SignCommand, UsageError};
use pkcs11_xml_signer::utils::output::print_error;
use pkcs11_xml_signer::utils::pkcs11_devices::{DEFAULT_MODULE_PATH, MODULE_PATH_ENV};

#[derive(Parser)]
#[command(name = "pkcs11-xml-signer")]
#[command(about = "Sign XML files with XAdES signatures using a key on a PKCS#11 token")]
#[command(version = env!("PKCS11_XML_SIGNER_VERSION"))]
struct Cli {
    /// Token user PIN
    #[arg(long, env = "PKCS11_PIN", hide_env_values = true)]
    pin: String,

    /// Digest algorithm (SHA224, SHA256, SHA384, SHA512)
    #[arg(long, default_value = "SHA256")]
    algorithm: String,

    /// Signature level (XML_NOT_ETSI, XAdES_BASELINE_B)
    #[arg(long, default_value = "XAdES_BASELINE_B")]
    level: String,

    /// Signature packaging (ENVELOPED, ENVELOPING, DETACHED)
    #[arg(long, default_value = "ENVELOPED")]
    packaging: String,

    /// PKCS#11 slot id of the token
    #[arg(long, default_value_t = 1)]
    slot: u64,

    /// Zero-based index of the signing key on the token
    #[arg(long, default_value_t = 0)]
    key_index: usize,

    /// Path to the PKCS#11 provider module
    #[arg(long, env = MODULE_PATH_ENV, default_value = DEFAULT_MODULE_PATH)]
    pkcs11_lib: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// XML file to sign
    file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut sign_cmd = SignCommand::new(cli.file, cli.pin);
    sign_cmd.algorithm = cli.algorithm;
    sign_cmd.level = cli.level;
    sign_cmd.packaging = cli.packaging;
    sign_cmd.slot = cli.slot;
    sign_cmd.key_index = cli.key_index;
    sign_cmd.pkcs11_lib = cli.pkcs11_lib;
    sign_cmd.verbose = cli.verbose;

    match sign_cmd.execute() {
        Ok(_) => Ok(()),
        Err(err) => {
            if let Some(usage) = err.downcast_ref::<UsageError>() {
                print_error(&usage.to_string());
                std::process::exit(1);
            }
            Err(err)
        }
    }
}
