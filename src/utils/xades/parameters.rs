//! Signing parameters: digest algorithm, level, packaging and signer identity.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use x509_cert::Certificate;

use super::constants::algorithm;
use crate::utils::certificate::KeyAlgorithm;

/// A parameter name that does not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    #[error("Unsupported digest algorithm '{0}'. Supported: SHA224, SHA256, SHA384, SHA512")]
    UnknownDigestAlgorithm(String),
    #[error(
        "Unsupported signature level '{0}'. Supported: XML_NOT_ETSI, XAdES_BASELINE_B, \
         XAdES_BASELINE_T, XAdES_BASELINE_LT, XAdES_BASELINE_LTA"
    )]
    UnknownSignatureLevel(String),
    #[error("Unsupported signature packaging '{0}'. Supported: ENVELOPED, ENVELOPING, DETACHED")]
    UnknownSignaturePackaging(String),
}

/// Digest algorithm used for references and for the signature itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => "SHA224",
            DigestAlgorithm::Sha256 => "SHA256",
            DigestAlgorithm::Sha384 => "SHA384",
            DigestAlgorithm::Sha512 => "SHA512",
        }
    }

    /// XML-DSig `DigestMethod` algorithm URI.
    pub fn uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => algorithm::SHA224,
            DigestAlgorithm::Sha256 => algorithm::SHA256,
            DigestAlgorithm::Sha384 => algorithm::SHA384,
            DigestAlgorithm::Sha512 => algorithm::SHA512,
        }
    }

    /// XML-DSig `SignatureMethod` URI for this digest and key family.
    pub fn signature_method_uri(&self, key: KeyAlgorithm) -> &'static str {
        match (key, self) {
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha224) => algorithm::RSA_SHA224,
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha256) => algorithm::RSA_SHA256,
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha384) => algorithm::RSA_SHA384,
            (KeyAlgorithm::Rsa, DigestAlgorithm::Sha512) => algorithm::RSA_SHA512,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha224) => algorithm::ECDSA_SHA224,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha256) => algorithm::ECDSA_SHA256,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha384) => algorithm::ECDSA_SHA384,
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Sha512) => algorithm::ECDSA_SHA512,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha224 => Sha224::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// DER prefix of the PKCS#1 `DigestInfo` wrapping a digest of this kind.
    pub fn digest_info_prefix(&self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha224 => &[
                0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x04, 0x05, 0x00, 0x04, 0x1c,
            ],
            DigestAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            DigestAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            DigestAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    /// `DigestInfo` DER structure for `digest`, as signed with `CKM_RSA_PKCS`.
    pub fn digest_info(&self, digest: &[u8]) -> Vec<u8> {
        let prefix = self.digest_info_prefix();
        let mut info = Vec::with_capacity(prefix.len() + digest.len());
        info.extend_from_slice(prefix);
        info.extend_from_slice(digest);
        info
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SHA224" => Ok(DigestAlgorithm::Sha224),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(ParameterError::UnknownDigestAlgorithm(s.to_string())),
        }
    }
}

/// Signature level. Only levels that need no timestamp authority can be
/// produced; the others parse so they can be rejected with a clear message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureLevel {
    XmlNotEtsi,
    XadesBaselineB,
    XadesBaselineT,
    XadesBaselineLt,
    XadesBaselineLta,
}

impl SignatureLevel {
    pub fn name(&self) -> &'static str {
        match self {
            SignatureLevel::XmlNotEtsi => "XML_NOT_ETSI",
            SignatureLevel::XadesBaselineB => "XAdES_BASELINE_B",
            SignatureLevel::XadesBaselineT => "XAdES_BASELINE_T",
            SignatureLevel::XadesBaselineLt => "XAdES_BASELINE_LT",
            SignatureLevel::XadesBaselineLta => "XAdES_BASELINE_LTA",
        }
    }

    /// Whether the signature carries XAdES qualifying properties.
    pub fn is_xades(&self) -> bool {
        !matches!(self, SignatureLevel::XmlNotEtsi)
    }

    /// Whether producing this level needs a timestamp authority.
    pub fn requires_timestamp(&self) -> bool {
        matches!(
            self,
            SignatureLevel::XadesBaselineT
                | SignatureLevel::XadesBaselineLt
                | SignatureLevel::XadesBaselineLta
        )
    }
}

impl fmt::Display for SignatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SignatureLevel {
    type Err = ParameterError;

    /// Level names are matched exactly, as printed by [`SignatureLevel::name`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "XML_NOT_ETSI" => Ok(SignatureLevel::XmlNotEtsi),
            "XAdES_BASELINE_B" => Ok(SignatureLevel::XadesBaselineB),
            "XAdES_BASELINE_T" => Ok(SignatureLevel::XadesBaselineT),
            "XAdES_BASELINE_LT" => Ok(SignatureLevel::XadesBaselineLt),
            "XAdES_BASELINE_LTA" => Ok(SignatureLevel::XadesBaselineLta),
            _ => Err(ParameterError::UnknownSignatureLevel(s.to_string())),
        }
    }
}

/// How the signature relates to the signed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignaturePackaging {
    /// Signature inserted into the signed document.
    Enveloped,
    /// Signed document embedded in the signature.
    Enveloping,
    /// Signature stored apart from the document it references.
    Detached,
}

impl SignaturePackaging {
    pub fn name(&self) -> &'static str {
        match self {
            SignaturePackaging::Enveloped => "ENVELOPED",
            SignaturePackaging::Enveloping => "ENVELOPING",
            SignaturePackaging::Detached => "DETACHED",
        }
    }
}

impl fmt::Display for SignaturePackaging {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SignaturePackaging {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ENVELOPED" => Ok(SignaturePackaging::Enveloped),
            "ENVELOPING" => Ok(SignaturePackaging::Enveloping),
            "DETACHED" => Ok(SignaturePackaging::Detached),
            _ => Err(ParameterError::UnknownSignaturePackaging(s.to_string())),
        }
    }
}

/// Everything the signature service needs besides the document.
#[derive(Debug, Clone)]
pub struct XadesParameters {
    pub digest_algorithm: DigestAlgorithm,
    pub signature_level: SignatureLevel,
    pub signature_packaging: SignaturePackaging,
    signing_certificate: Option<Certificate>,
    certificate_chain: Vec<Certificate>,
    signing_time: DateTime<Utc>,
}

impl XadesParameters {
    /// Parameters signed "now", truncated to whole seconds.
    pub fn new(
        digest_algorithm: DigestAlgorithm,
        signature_level: SignatureLevel,
        signature_packaging: SignaturePackaging,
    ) -> Self {
        Self {
            digest_algorithm,
            signature_level,
            signature_packaging,
            signing_certificate: None,
            certificate_chain: Vec::new(),
            signing_time: Utc::now().trunc_subsecs(0),
        }
    }

    /// Fix the claimed signing time.
    pub fn with_signing_time(mut self, signing_time: DateTime<Utc>) -> Self {
        self.signing_time = signing_time.trunc_subsecs(0);
        self
    }

    pub fn set_signing_certificate(&mut self, certificate: Certificate) {
        self.signing_certificate = Some(certificate);
    }

    pub fn set_certificate_chain(&mut self, chain: Vec<Certificate>) {
        self.certificate_chain = chain;
    }

    pub fn signing_certificate(&self) -> Option<&Certificate> {
        self.signing_certificate.as_ref()
    }

    pub fn certificate_chain(&self) -> &[Certificate] {
        &self.certificate_chain
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }
}
