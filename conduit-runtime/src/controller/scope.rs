// Evaluation scope
// Resolves references to node values at the moment an expression reads them

use crate::controller::graph::resolve_reference;
use crate::controller::node::Node;
use crate::expression::Scope;
use crate::value::Value;

use std::collections::BTreeMap;

/// A scope over node handles taken from the graph.
///
/// Only the handles are captured; each value is read under its node's own
/// lock when a reference is looked up, so a node evaluated earlier in a pass
/// is seen with its new value.
pub struct NodeScope {
    nodes: BTreeMap<String, Node>,
}

impl NodeScope {
    pub fn new(nodes: BTreeMap<String, Node>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Scope for NodeScope {
    fn lookup(&self, path: &[&str]) -> Option<(usize, Value)> {
        let (id, consumed) = resolve_reference(path, |id| self.nodes.contains_key(id))?;
        self.nodes.get(&id).map(|node| (consumed, node.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::config_node::ExportConfigNode;
    use crate::expression::evaluate_str;
    use crate::syntax::Block;

    use std::sync::Arc;

    fn export(label: &str, value: &str) -> Node {
        Node::Config(Arc::new(
            ExportConfigNode::new(Block::new("export", label).with_attr("value", value)).unwrap(),
        ))
    }

    #[test]
    fn test_lookup_reads_current_value() {
        let node = export("name", "'loki'");
        let mut nodes = BTreeMap::new();
        nodes.insert(node.id().to_string(), node.clone());
        let scope = NodeScope::new(nodes);

        assert_eq!(
            evaluate_str("export.name.value", &scope).unwrap(),
            Value::Null
        );

        node.evaluate(&scope).unwrap();
        assert_eq!(
            evaluate_str("upper(export.name.value)", &scope).unwrap(),
            Value::from("LOKI")
        );
    }

    #[test]
    fn test_unknown_reference() {
        let scope = NodeScope::new(BTreeMap::new());
        assert!(scope.is_empty());
        let err = evaluate_str("export.missing.value", &scope).unwrap_err();
        assert!(err.message.contains("unknown reference"));
    }
}
