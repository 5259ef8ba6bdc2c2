//! Assembly of the `ds:Signature` element.

use std::fmt::Write;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use super::c14n;
use super::constants::{
    algorithm, DSIG_NS, OBJECT_TYPE, SIGNED_PROPERTIES_TYPE, XADES_NS, XML_MIME_TYPE,
};
use super::parameters::{SignaturePackaging, XadesParameters};
use super::XadesError;
use crate::utils::certificate::{self, KeyAlgorithm};
use crate::utils::document::Document;
use crate::utils::token::SignatureValue;

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// Bytes kept verbatim in the `URI` of a detached reference (RFC 3986
/// unreserved characters).
const URI_UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Element ids, derived from the inputs so equal inputs give equal output.
struct Ids {
    signature: String,
    document_reference: String,
    signed_properties: String,
    signature_value: String,
    object: String,
}

impl Ids {
    fn derive(document: &Document, parameters: &XadesParameters, certificate_der: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(parameters.signing_time().to_rfc3339().as_bytes());
        hasher.update(certificate_der);
        hasher.update(document.name().as_bytes());
        hasher.update(document.bytes());
        let base = hex::encode(&hasher.finalize()[..16]);

        Self {
            signature: format!("id-{base}"),
            document_reference: format!("r-id-{base}-1"),
            signed_properties: format!("xades-id-{base}"),
            signature_value: format!("value-id-{base}"),
            object: format!("o-id-{base}-1"),
        }
    }
}

/// Builds the signature for one document and one set of parameters.
pub(crate) struct SignatureBuilder<'a> {
    document: &'a Document,
    parameters: &'a XadesParameters,
    signing_certificate: &'a Certificate,
    key_algorithm: KeyAlgorithm,
    ids: Ids,
}

impl<'a> SignatureBuilder<'a> {
    pub(crate) fn new(
        document: &'a Document,
        parameters: &'a XadesParameters,
    ) -> Result<Self, XadesError> {
        let level = parameters.signature_level;
        if level.requires_timestamp() {
            return Err(XadesError::UnsupportedLevel(level));
        }
        let signing_certificate = parameters
            .signing_certificate()
            .ok_or(XadesError::MissingSigningCertificate)?;
        let key_algorithm = KeyAlgorithm::of(signing_certificate)
            .ok_or(XadesError::UnsupportedKeyAlgorithm)?;
        let certificate_der = certificate::to_der(signing_certificate)?;
        let ids = Ids::derive(document, parameters, &certificate_der);

        Ok(Self {
            document,
            parameters,
            signing_certificate,
            key_algorithm,
            ids,
        })
    }

    /// Canonical `ds:SignedInfo`, the bytes the token signs.
    pub(crate) fn to_be_signed(&self) -> Result<Vec<u8>, XadesError> {
        let signature = self.signature_element(None)?;
        let signed_info = c14n::canonicalize_element(&signature, DSIG_NS, "SignedInfo")?;
        Ok(signed_info.into_bytes())
    }

    /// The signed output document.
    pub(crate) fn signed_document(&self, value: &SignatureValue) -> Result<String, XadesError> {
        if value.as_bytes().is_empty() {
            return Err(XadesError::EmptySignatureValue);
        }
        let signature = self.signature_element(Some(value))?;

        match self.parameters.signature_packaging {
            SignaturePackaging::Enveloped => {
                let source = self.source_text()?;
                insert_before_root_end(source, &signature)
            }
            SignaturePackaging::Enveloping | SignaturePackaging::Detached => {
                Ok(format!("{XML_DECLARATION}\n{signature}"))
            }
        }
    }

    fn source_text(&self) -> Result<&str, XadesError> {
        std::str::from_utf8(self.document.bytes())
            .map_err(|_| XadesError::NotUtf8(self.document.name().to_string()))
    }

    fn digest_b64(&self, data: &[u8]) -> String {
        STANDARD.encode(self.parameters.digest_algorithm.digest(data))
    }

    fn signature_element(&self, value: Option<&SignatureValue>) -> Result<String, XadesError> {
        let qualifying_properties = if self.parameters.signature_level.is_xades() {
            Some(self.qualifying_properties()?)
        } else {
            None
        };
        let signed_properties_digest = match &qualifying_properties {
            Some(properties) => Some(self.signed_properties_digest(properties)?),
            None => None,
        };

        let mut xml = String::new();
        let _ = write!(
            xml,
            "<ds:Signature xmlns:ds=\"{DSIG_NS}\" Id=\"{}\">",
            self.ids.signature
        );
        xml.push_str(&self.signed_info(signed_properties_digest.as_deref())?);
        let _ = write!(
            xml,
            "<ds:SignatureValue Id=\"{}\">{}</ds:SignatureValue>",
            self.ids.signature_value,
            value.map(|v| STANDARD.encode(v.as_bytes())).unwrap_or_default()
        );
        xml.push_str(&self.key_info()?);
        if self.parameters.signature_packaging == SignaturePackaging::Enveloping {
            let _ = write!(
                xml,
                "<ds:Object Id=\"{}\">{}</ds:Object>",
                self.ids.object,
                STANDARD.encode(self.document.bytes())
            );
        }
        if let Some(properties) = qualifying_properties {
            let _ = write!(xml, "<ds:Object>{properties}</ds:Object>");
        }
        xml.push_str("</ds:Signature>");
        Ok(xml)
    }

    fn signed_info(&self, signed_properties_digest: Option<&str>) -> Result<String, XadesError> {
        let digest_method = self.parameters.digest_algorithm.uri();
        let signature_method = self
            .parameters
            .digest_algorithm
            .signature_method_uri(self.key_algorithm);

        let mut xml = String::from("<ds:SignedInfo>");
        let _ = write!(
            xml,
            "<ds:CanonicalizationMethod Algorithm=\"{}\"/>\
             <ds:SignatureMethod Algorithm=\"{signature_method}\"/>",
            algorithm::EXC_C14N
        );
        xml.push_str(&self.document_reference()?);
        if let Some(digest) = signed_properties_digest {
            let _ = write!(
                xml,
                "<ds:Reference Type=\"{SIGNED_PROPERTIES_TYPE}\" URI=\"#{}\">\
                 <ds:Transforms><ds:Transform Algorithm=\"{}\"/></ds:Transforms>\
                 <ds:DigestMethod Algorithm=\"{digest_method}\"/>\
                 <ds:DigestValue>{digest}</ds:DigestValue></ds:Reference>",
                self.ids.signed_properties,
                algorithm::EXC_C14N
            );
        }
        xml.push_str("</ds:SignedInfo>");
        Ok(xml)
    }

    fn document_reference(&self) -> Result<String, XadesError> {
        let digest_method = self.parameters.digest_algorithm.uri();
        let id = &self.ids.document_reference;

        let (attributes, transforms, digest) = match self.parameters.signature_packaging {
            SignaturePackaging::Enveloped => {
                let canonical = c14n::canonicalize(self.source_text()?)?;
                (
                    format!("Id=\"{id}\" URI=\"\""),
                    format!(
                        "<ds:Transforms><ds:Transform Algorithm=\"{}\"/>\
                         <ds:Transform Algorithm=\"{}\"/></ds:Transforms>",
                        algorithm::ENVELOPED_SIGNATURE,
                        algorithm::EXC_C14N
                    ),
                    self.digest_b64(canonical.as_bytes()),
                )
            }
            SignaturePackaging::Enveloping => {
                // Checks the content is well-formed before it is embedded.
                c14n::canonicalize(self.source_text()?)?;
                (
                    format!(
                        "Id=\"{id}\" Type=\"{OBJECT_TYPE}\" URI=\"#{}\"",
                        self.ids.object
                    ),
                    format!(
                        "<ds:Transforms><ds:Transform Algorithm=\"{}\"/></ds:Transforms>",
                        algorithm::BASE64
                    ),
                    self.digest_b64(self.document.bytes()),
                )
            }
            SignaturePackaging::Detached => (
                format!("Id=\"{id}\" URI=\"{}\"", detached_uri(self.document.name())),
                String::new(),
                self.digest_b64(self.document.bytes()),
            ),
        };

        Ok(format!(
            "<ds:Reference {attributes}>{transforms}\
             <ds:DigestMethod Algorithm=\"{digest_method}\"/>\
             <ds:DigestValue>{digest}</ds:DigestValue></ds:Reference>"
        ))
    }

    fn key_info(&self) -> Result<String, XadesError> {
        let mut chain: Vec<&Certificate> = self.parameters.certificate_chain().iter().collect();
        if chain.first() != Some(&self.signing_certificate) {
            chain.retain(|cert| *cert != self.signing_certificate);
            chain.insert(0, self.signing_certificate);
        }

        let mut xml = String::from("<ds:KeyInfo><ds:X509Data>");
        for cert in chain {
            let der = certificate::to_der(cert)?;
            let _ = write!(
                xml,
                "<ds:X509Certificate>{}</ds:X509Certificate>",
                STANDARD.encode(der)
            );
        }
        xml.push_str("</ds:X509Data></ds:KeyInfo>");
        Ok(xml)
    }

    fn qualifying_properties(&self) -> Result<String, XadesError> {
        let digest_method = self.parameters.digest_algorithm.uri();
        let certificate_der = certificate::to_der(self.signing_certificate)?;
        let issuer_serial = certificate::issuer_serial_der(self.signing_certificate)?;
        let signing_time = self
            .parameters
            .signing_time()
            .format("%Y-%m-%dT%H:%M:%SZ");

        let mut xml = String::new();
        let _ = write!(
            xml,
            "<xades:QualifyingProperties xmlns:xades=\"{XADES_NS}\" Target=\"#{}\">",
            self.ids.signature
        );
        let _ = write!(
            xml,
            "<xades:SignedProperties Id=\"{}\"><xades:SignedSignatureProperties>\
             <xades:SigningTime>{signing_time}</xades:SigningTime>\
             <xades:SigningCertificateV2><xades:Cert><xades:CertDigest>\
             <ds:DigestMethod Algorithm=\"{digest_method}\"/>\
             <ds:DigestValue>{}</ds:DigestValue></xades:CertDigest>\
             <xades:IssuerSerialV2>{}</xades:IssuerSerialV2>\
             </xades:Cert></xades:SigningCertificateV2></xades:SignedSignatureProperties>",
            self.ids.signed_properties,
            self.digest_b64(&certificate_der),
            STANDARD.encode(issuer_serial)
        );
        let _ = write!(
            xml,
            "<xades:SignedDataObjectProperties>\
             <xades:DataObjectFormat ObjectReference=\"#{}\">\
             <xades:MimeType>{XML_MIME_TYPE}</xades:MimeType></xades:DataObjectFormat>\
             </xades:SignedDataObjectProperties></xades:SignedProperties>",
            self.ids.document_reference
        );
        xml.push_str("</xades:QualifyingProperties>");
        Ok(xml)
    }

    /// Digest of the canonical `xades:SignedProperties`, placed in the
    /// same `ds:Signature`/`ds:Object` context it has in the output.
    fn signed_properties_digest(&self, qualifying_properties: &str) -> Result<String, XadesError> {
        let context = format!(
            "<ds:Signature xmlns:ds=\"{DSIG_NS}\"><ds:Object>{qualifying_properties}</ds:Object>\
             </ds:Signature>"
        );
        let canonical = c14n::canonicalize_element(&context, XADES_NS, "SignedProperties")?;
        Ok(self.digest_b64(canonical.as_bytes()))
    }
}

/// Relative URI reference to a detached document named `name`.
fn detached_uri(name: &str) -> String {
    utf8_percent_encode(name, URI_UNRESERVED).to_string()
}

/// Insert `signature` as the last child of the root element of `source`,
/// leaving every other byte of `source` in place.
fn insert_before_root_end(source: &str, signature: &str) -> Result<String, XadesError> {
    let mut reader = Reader::from_str(source);
    let mut depth = 0usize;

    loop {
        let position = reader.buffer_position() as usize;
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let mut signed = String::with_capacity(source.len() + signature.len());
                    signed.push_str(&source[..position]);
                    signed.push_str(signature);
                    signed.push_str(&source[position..]);
                    return Ok(signed);
                }
            }
            Event::Empty(element) if depth == 0 => {
                let end = reader.buffer_position() as usize;
                let qname = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                let open_tag = source[position..end]
                    .trim_end_matches('>')
                    .trim_end_matches('/')
                    .trim_end();
                let mut signed =
                    String::with_capacity(source.len() + signature.len() + qname.len());
                signed.push_str(&source[..position]);
                signed.push_str(open_tag);
                signed.push('>');
                signed.push_str(signature);
                let _ = write!(signed, "</{qname}>");
                signed.push_str(&source[end..]);
                return Ok(signed);
            }
            Event::Eof => return Err(XadesError::NoRootElement),
            _ => {}
        }
    }
}
