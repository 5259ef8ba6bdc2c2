//! Sign command implementation that signs an XML file with a key on a
//! PKCS#11 token.
//!
//! A run validates its input, opens a token session, picks a key, computes
//! the bytes to sign, has the token sign them, embeds the signature and
//! writes `<stem>_signed.xml` next to the input. The session is scoped to
//! the token value and released when it goes out of scope, whatever the
//! outcome.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use x509_cert::Certificate;

use crate::utils::{
    certificate,
    document::{signed_output_path, Document},
    output::{print_info, print_success, set_verbose, OutputLevel},
    pkcs11_devices::{Pkcs11Connector, DEFAULT_MODULE_PATH},
    token::{select_key, KeyEntry, SignatureToken, TokenConfig, TokenConnector},
    xades::{
        DigestAlgorithm, ParameterError, SignatureLevel, SignaturePackaging, SignatureService,
        XadesParameters, XadesService,
    },
};

/// Context attached to every failure past input validation.
pub const SIGNING_FAILED: &str = "Error occurred signing file";

/// Invalid invocation, detected before the token is touched.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("File '{}' is not an .xml file", .0.display())]
    NotXmlFile(PathBuf),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

/// Implementation of the 'sign' command.
#[derive(Clone)]
pub struct SignCommand {
    /// XML file to sign
    pub file: PathBuf,
    /// Token user PIN
    pub pin: String,
    /// Digest algorithm name
    pub algorithm: String,
    /// Signature level name
    pub level: String,
    /// Signature packaging name
    pub packaging: String,
    /// Slot id of the token
    pub slot: u64,
    /// Zero-based index of the key among the token's keys
    pub key_index: usize,
    /// PKCS#11 provider module
    pub pkcs11_lib: PathBuf,
    /// Enable verbose output
    pub verbose: bool,
    signing_time: Option<DateTime<Utc>>,
}

impl SignCommand {
    /// Create a new SignCommand with the default algorithm, level,
    /// packaging, slot, key index and module.
    pub fn new(file: PathBuf, pin: String) -> Self {
        Self {
            file,
            pin,
            algorithm: DigestAlgorithm::Sha256.name().to_string(),
            level: SignatureLevel::XadesBaselineB.name().to_string(),
            packaging: SignaturePackaging::Enveloped.name().to_string(),
            slot: 1,
            key_index: 0,
            pkcs11_lib: PathBuf::from(DEFAULT_MODULE_PATH),
            verbose: false,
            signing_time: None,
        }
    }

    /// Claim `signing_time` instead of the current time.
    pub fn with_signing_time(mut self, signing_time: DateTime<Utc>) -> Self {
        self.signing_time = Some(signing_time);
        self
    }

    /// Execute the sign command against the configured PKCS#11 module.
    pub fn execute(&self) -> Result<PathBuf> {
        self.execute_with(&Pkcs11Connector, &XadesService::new())
    }

    /// Execute the sign command with the given token connector and
    /// signature service. Returns the path of the signed file.
    ///
    /// Usage errors come back as a bare [`UsageError`]; everything else is
    /// wrapped with [`SIGNING_FAILED`].
    pub fn execute_with<C, S>(&self, connector: &C, service: &S) -> Result<PathBuf>
    where
        C: TokenConnector,
        S: SignatureService,
    {
        set_verbose(self.verbose);
        let (parameters, output_path) = self.validate()?;

        self.sign_file(connector, service, parameters, &output_path)
            .context(SIGNING_FAILED)?;

        print_success(
            &format!("Signed file written to {}", output_path.display()),
            OutputLevel::Normal,
        );
        Ok(output_path)
    }

    fn validate(&self) -> Result<(XadesParameters, PathBuf), UsageError> {
        let output_path = signed_output_path(&self.file)
            .ok_or_else(|| UsageError::NotXmlFile(self.file.clone()))?;

        let digest_algorithm: DigestAlgorithm = self.algorithm.parse()?;
        let signature_level: SignatureLevel = self.level.parse()?;
        let signature_packaging: SignaturePackaging = self.packaging.parse()?;

        let mut parameters =
            XadesParameters::new(digest_algorithm, signature_level, signature_packaging);
        if let Some(signing_time) = self.signing_time {
            parameters = parameters.with_signing_time(signing_time);
        }
        Ok((parameters, output_path))
    }

    fn sign_file<C, S>(
        &self,
        connector: &C,
        service: &S,
        mut parameters: XadesParameters,
        output_path: &Path,
    ) -> Result<()>
    where
        C: TokenConnector,
        S: SignatureService,
    {
        let document = Document::from_file(&self.file)?;
        let config = TokenConfig {
            module_path: self.pkcs11_lib.clone(),
            slot: self.slot,
            pin: self.pin.clone(),
        };

        let signed = {
            let token = connector.connect(&config)?;

            let keys = token.keys()?;
            log_keys(&keys);

            let key = select_key(&keys, self.key_index)?;
            print_info(
                &format!("Signing with key: {}", key.subject()),
                OutputLevel::Normal,
            );
            log_chain(&key.certificate_chain);

            parameters.set_signing_certificate(key.certificate.clone());
            parameters.set_certificate_chain(key.certificate_chain.clone());

            let to_be_signed = service.data_to_sign(&document, &parameters)?;
            let signature_value = token.sign(&to_be_signed, parameters.digest_algorithm, key)?;
            service.sign_document(&document, &parameters, &signature_value)?
        };

        signed.save(output_path)?;
        Ok(())
    }
}

fn log_keys(keys: &[KeyEntry]) {
    print_info(
        &format!("Found {} key(s) on token", keys.len()),
        OutputLevel::Normal,
    );
    for (index, key) in keys.iter().enumerate() {
        print_info(
            &format!("  [{index}] {} (issuer: {})", key.subject(), key.issuer()),
            OutputLevel::Normal,
        );
    }
}

fn log_chain(chain: &[Certificate]) {
    print_info("Certificate chain:", OutputLevel::Verbose);
    for cert in chain {
        print_info(
            &format!("  {}", certificate::subject_name(cert)),
            OutputLevel::Verbose,
        );
    }
}
