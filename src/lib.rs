//! Sign XML documents with XAdES signatures using keys held on PKCS#11
//! tokens.

pub mod commands;
pub mod utils;
