// Configuration documents
// The declarative block list the controller loads: parsing, identities and structural equality

pub mod error;

pub use error::{SyntaxError, SyntaxErrorKind};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Block name of config-only value declarations
pub const EXPORT_BLOCK: &str = "export";

/// A whole configuration document
///
/// ```yaml
/// blocks:
///   - block: export
///     label: listen
///     value: "127.0.0.1:9999"
///   - block: loki.echo
///     label: out
///   - block: loki.source.aws_firehose
///     label: default
///     listen_address: "${{ export.listen.value }}"
///     forward_to: "${{ [loki.echo.out.receiver] }}"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        if source.trim().is_empty() {
            return Ok(Document::default());
        }
        serde_yaml::from_str(source).map_err(|e| SyntaxError::from_yaml_error(&e, source))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SyntaxError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| {
            SyntaxError::new(
                format!("failed to read {}: {}", path.display(), e),
                SyntaxErrorKind::Io,
            )
        })?;
        Self::parse(&source)
    }
}

/// One declaration: a block name, an optional label and its attributes.
///
/// Blocks compare structurally; any change to name, label or any attribute
/// makes two blocks different.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Block {
    #[serde(rename = "block")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub body: BTreeMap<String, serde_yaml::Value>,
}

impl Block {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: Some(label.into()),
            body: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter; `value` is parsed as YAML
    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        let parsed = serde_yaml::from_str(value)
            .unwrap_or_else(|_| serde_yaml::Value::String(value.to_string()));
        self.body.insert(key.to_string(), parsed);
        self
    }

    /// Identity of the node this block declares: `name.label`
    pub fn node_id(&self) -> String {
        match &self.label {
            Some(label) => format!("{}.{}", self.name, label),
            None => self.name.clone(),
        }
    }

    pub fn is_export(&self) -> bool {
        self.name == EXPORT_BLOCK
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} \"{}\"", self.name, label),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Valid block labels: `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_label(label: &str) -> bool {
    let mut chars = label.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
blocks:
  - block: export
    label: listen
    value: "127.0.0.1:9999"
  - block: loki.source.aws_firehose
    label: default
    listen_address: "${{ export.listen.value }}"
    forward_to: "${{ [loki.echo.out.receiver] }}"
"#;

    #[test]
    fn test_parse_document() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].node_id(), "export.listen");
        assert!(doc.blocks[0].is_export());
        assert_eq!(doc.blocks[1].node_id(), "loki.source.aws_firehose.default");
        assert_eq!(doc.blocks[1].body.len(), 2);
    }

    #[test]
    fn test_block_equality_is_structural() {
        let a = Document::parse(SAMPLE).unwrap();
        let b = Document::parse(SAMPLE).unwrap();
        assert_eq!(a, b);

        let changed = Document::parse(&SAMPLE.replace("9999", "9998")).unwrap();
        assert_ne!(a.blocks[0], changed.blocks[0]);
        assert_eq!(a.blocks[1], changed.blocks[1]);
    }

    #[test]
    fn test_missing_block_name() {
        let err = Document::parse("blocks:\n  - label: x\n").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::Schema);
        assert!(err.message.contains("missing field 'block'"));
        assert!(err.suggestion.is_some());
    }

    #[test]
    fn test_unknown_top_level_key() {
        let err = Document::parse("components: []\n").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::Schema);
    }

    #[test]
    fn test_empty_document() {
        assert!(Document::parse("  \n").unwrap().blocks.is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let doc = Document::from_file(file.path()).unwrap();
        assert_eq!(doc.blocks.len(), 2);

        let err = Document::from_file("/definitely/not/here.yaml").unwrap_err();
        assert_eq!(err.kind, SyntaxErrorKind::Io);
    }

    #[test]
    fn test_label_validation() {
        assert!(is_valid_label("default"));
        assert!(is_valid_label("_x1"));
        assert!(!is_valid_label("1x"));
        assert!(!is_valid_label("a-b"));
        assert!(!is_valid_label(""));
    }
}
