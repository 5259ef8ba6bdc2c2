//! Exclusive XML canonicalization (`xml-exc-c14n#`, without comments),
//! delegated to libxml2.

use libxml::parser::{Parser, ParserOptions};
use libxml::tree::{c14n, Document};
use libxml::xpath;

/// Prefix bound to the requested namespace while locating an element.
const TARGET_PREFIX: &str = "target";

#[derive(Debug, thiserror::Error)]
pub enum C14nError {
    #[error("Malformed XML: {0}")]
    Xml(String),
    #[error("XPath evaluation failed: {0}")]
    XPath(String),
    #[error("Element {{{namespace}}}{local_name} not found")]
    ElementNotFound {
        namespace: String,
        local_name: String,
    },
    #[error("libxml2 could not canonicalize the node set")]
    Canonicalize,
}

fn options() -> c14n::CanonicalizationOptions {
    c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::ExclusiveCanonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    }
}

fn parse(xml: &str) -> Result<Document, C14nError> {
    let options = ParserOptions {
        recover: false,
        no_net: true,
        ..ParserOptions::default()
    };
    Parser::default()
        .parse_string_with_options(xml, options)
        .map_err(|e| C14nError::Xml(format!("{e:?}")))
}

/// Canonicalize a whole document.
pub fn canonicalize(xml: &str) -> Result<String, C14nError> {
    parse(xml)?
        .canonicalize(options(), None)
        .map_err(|_| C14nError::Canonicalize)
}

/// Canonicalize the first element named `{namespace}local_name` and its
/// descendants.
pub fn canonicalize_element(
    xml: &str,
    namespace: &str,
    local_name: &str,
) -> Result<String, C14nError> {
    let doc = parse(xml)?;
    let ctx = xpath::Context::new(&doc).map_err(|e| C14nError::XPath(format!("{e:?}")))?;
    ctx.register_namespace(TARGET_PREFIX, namespace)
        .map_err(|e| C14nError::XPath(format!("{e:?}")))?;

    let mut node = ctx
        .evaluate(&format!("//{TARGET_PREFIX}:{local_name}"))
        .map_err(|e| C14nError::XPath(format!("{e:?}")))?
        .get_nodes_as_vec()
        .into_iter()
        .next()
        .ok_or_else(|| C14nError::ElementNotFound {
            namespace: namespace.to_string(),
            local_name: local_name.to_string(),
        })?;

    node.canonicalize(options())
        .map_err(|_| C14nError::Canonicalize)
}
