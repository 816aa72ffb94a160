//! Portable byte encoding for nodes and compiled plans.
//!
//! The body is JSON wrapped in a versioned envelope so decoders can reject
//! encodings they do not understand instead of misreading them.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    body: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    body: T,
}

pub(crate) fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&EnvelopeRef {
        version: FORMAT_VERSION,
        body,
    })?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
    if envelope.version != FORMAT_VERSION {
        return Err(Error::Serde(format!(
            "unsupported node encoding version {} (expected {FORMAT_VERSION})",
            envelope.version
        )));
    }
    Ok(envelope.body)
}

#[cfg(test)]
mod tests {
    use crate::node::{Node, count};
    use crate::value::Value;

    #[test]
    fn decoded_nodes_match_originals() {
        let root = Node::table("main", "project");
        let manager = Node::Reference(crate::node::LinkNode {
            parent: Box::new(root.clone()),
            name: "manager".to_string(),
            table: "person".to_string(),
        });
        let cond = manager
            .column_of("first_name")
            .like("A%")
            .and(count(root.column_of("id")).gt(Value::Null));

        let bytes = cond.to_bytes().unwrap();
        let decoded = Node::from_bytes(&bytes).unwrap();
        assert!(decoded.matches(&cond));
        assert_eq!(decoded.root().unwrap().db_key, "main");

        // Decoded nodes keep composing.
        let extended = decoded.or(manager.is_null());
        assert_eq!(extended.root_table(), Some("project"));
    }

    #[test]
    fn rejects_foreign_versions_and_garbage() {
        let bytes = br#"{"version":99,"body":{"Alias":"x"}}"#;
        assert!(Node::from_bytes(bytes).is_err());
        assert!(Node::from_bytes(b"not json").is_err());
    }
}
