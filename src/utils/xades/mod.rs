//! XAdES signature production.
//!
//! Signing happens in two passes around the token:
//!
//! 1. [`SignatureService::data_to_sign`] computes the canonical
//!    `ds:SignedInfo` for a document and a set of parameters.
//! 2. The token signs those bytes.
//! 3. [`SignatureService::sign_document`] rebuilds the same `ds:SignedInfo`
//!    and embeds the signature value, the certificate chain and the XAdES
//!    qualifying properties into the output document.
//!
//! Both passes derive everything from the document and the parameters, so
//! the parameters (signing time included) must not change in between.

pub mod c14n;
pub mod constants;
pub mod parameters;
mod signature;

pub use parameters::{
    DigestAlgorithm, ParameterError, SignatureLevel, SignaturePackaging, XadesParameters,
};

use crate::utils::document::{Document, SIGNED_SUFFIX, XML_EXTENSION};
use crate::utils::token::{SignatureValue, ToBeSigned};
use c14n::C14nError;
use signature::SignatureBuilder;

/// Errors raised while computing or embedding a signature.
#[derive(Debug, thiserror::Error)]
pub enum XadesError {
    #[error("Document '{0}' is not valid UTF-8")]
    NotUtf8(String),
    #[error("Failed to canonicalize XML: {0}")]
    Canonicalization(#[from] C14nError),
    #[error("Malformed XML document: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Document has no root element")]
    NoRootElement,
    #[error("No signing certificate set in the signature parameters")]
    MissingSigningCertificate,
    #[error("Signing certificate uses an unsupported key algorithm (expected RSA or EC)")]
    UnsupportedKeyAlgorithm,
    #[error("Signature level {0} requires a timestamp authority, which is not configured")]
    UnsupportedLevel(SignatureLevel),
    #[error("Certificate encoding failed: {0}")]
    Certificate(#[from] der::Error),
    #[error("Token returned an empty signature value")]
    EmptySignatureValue,
}

/// Shapes documents into signed XML.
pub trait SignatureService {
    /// Canonical bytes to sign for `document` under `parameters`.
    fn data_to_sign(
        &self,
        document: &Document,
        parameters: &XadesParameters,
    ) -> Result<ToBeSigned, XadesError>;

    /// Signed document embedding `signature_value`.
    fn sign_document(
        &self,
        document: &Document,
        parameters: &XadesParameters,
        signature_value: &SignatureValue,
    ) -> Result<Document, XadesError>;
}

/// XAdES baseline signature service.
#[derive(Debug, Default, Clone)]
pub struct XadesService;

impl XadesService {
    pub fn new() -> Self {
        Self
    }
}

impl SignatureService for XadesService {
    fn data_to_sign(
        &self,
        document: &Document,
        parameters: &XadesParameters,
    ) -> Result<ToBeSigned, XadesError> {
        let builder = SignatureBuilder::new(document, parameters)?;
        Ok(ToBeSigned(builder.to_be_signed()?))
    }

    fn sign_document(
        &self,
        document: &Document,
        parameters: &XadesParameters,
        signature_value: &SignatureValue,
    ) -> Result<Document, XadesError> {
        let builder = SignatureBuilder::new(document, parameters)?;
        let signed = builder.signed_document(signature_value)?;
        Ok(Document::new(
            signed_name(document.name()),
            signed.into_bytes(),
        ))
    }
}

fn signed_name(name: &str) -> String {
    let stem = name.strip_suffix(".xml").unwrap_or(name);
    format!("{stem}{SIGNED_SUFFIX}.{XML_EXTENSION}")
}
