//! X.509 helpers shared by the token and XAdES layers.

use der::asn1::ObjectIdentifier;
use der::{Encode, Sequence};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::serial_number::SerialNumber;
use x509_cert::Certificate;

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// Public key family of a certificate, which fixes the signature method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

impl KeyAlgorithm {
    /// Detect the key family from the certificate's SubjectPublicKeyInfo.
    pub fn of(certificate: &Certificate) -> Option<Self> {
        let oid = certificate
            .tbs_certificate
            .subject_public_key_info
            .algorithm
            .oid;
        if oid == RSA_ENCRYPTION {
            Some(KeyAlgorithm::Rsa)
        } else if oid == EC_PUBLIC_KEY {
            Some(KeyAlgorithm::Ecdsa)
        } else {
            None
        }
    }
}

/// `IssuerSerial` from RFC 5035, as carried base64-encoded in
/// `xades:IssuerSerialV2`.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct IssuerSerial {
    issuer: Vec<GeneralName>,
    serial_number: SerialNumber,
}

/// DER certificate bytes.
pub fn to_der(certificate: &Certificate) -> Result<Vec<u8>, der::Error> {
    certificate.to_der()
}

/// DER `IssuerSerial` of a certificate.
pub fn issuer_serial_der(certificate: &Certificate) -> Result<Vec<u8>, der::Error> {
    let tbs = &certificate.tbs_certificate;
    IssuerSerial {
        issuer: vec![GeneralName::DirectoryName(tbs.issuer.clone())],
        serial_number: tbs.serial_number.clone(),
    }
    .to_der()
}

pub fn subject_name(certificate: &Certificate) -> String {
    certificate.tbs_certificate.subject.to_string()
}

pub fn issuer_name(certificate: &Certificate) -> String {
    certificate.tbs_certificate.issuer.to_string()
}

fn is_self_issued(certificate: &Certificate) -> bool {
    certificate.tbs_certificate.subject == certificate.tbs_certificate.issuer
}

/// Order `leaf` and its issuers found in `pool` into a chain.
///
/// Issuers are matched by name. The walk stops at a self-issued
/// certificate, when no issuer is found, or when a name repeats.
pub fn build_chain(leaf: &Certificate, pool: &[Certificate]) -> Vec<Certificate> {
    let mut chain = vec![leaf.clone()];
    let mut current = leaf;

    while !is_self_issued(current) {
        let issuer_name = &current.tbs_certificate.issuer;
        let Some(issuer) = pool
            .iter()
            .find(|candidate| &candidate.tbs_certificate.subject == issuer_name)
        else {
            break;
        };

        if chain
            .iter()
            .any(|seen| seen.tbs_certificate.subject == issuer.tbs_certificate.subject)
        {
            break;
        }

        chain.push(issuer.clone());
        current = issuer;
    }

    chain
}
