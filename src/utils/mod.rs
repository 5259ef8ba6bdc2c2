pub mod certificate;
pub mod document;
pub mod output;
pub mod pkcs11_devices;
pub mod token;
pub mod xades;
