// Dependency Graph
// Nodes keyed by identity with edges derived from the references in their declarations

use crate::controller::node::Node;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

/// Error type for graph operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node '{0}' does not exist")]
    NotFound(String),

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("{node}: unknown reference '{reference}'")]
    UnknownReference { node: String, reference: String },

    #[error("node '{id}' cannot be replaced: {message}")]
    InvalidReplacement { id: String, message: String },
}

/// The live dependency graph.
///
/// An edge `A -> B` in `dependencies` means A reads B, so B is evaluated
/// first. Edges are only ever derived from declarations by
/// [`DependencyGraph::resolve_edges`], never while evaluating.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, Node>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Nodes whose declarations changed since edges were last resolved
    stale: BTreeSet<String>,
    /// Set when nodes were added or removed; every reference may resolve differently
    membership_changed: bool,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `node`, or give an existing node with the same identity the
    /// new declaration. Returns the node now held by the graph.
    pub fn add_or_replace(&mut self, node: Node) -> Result<Node, GraphError> {
        let id = node.id().to_string();
        self.stale.insert(id.clone());

        if let Some(existing) = self.nodes.get(&id) {
            existing
                .replace_block(node.block())
                .map_err(|err| GraphError::InvalidReplacement {
                    id: id.clone(),
                    message: err.to_string(),
                })?;
            return Ok(existing.clone());
        }

        self.nodes.insert(id.clone(), node.clone());
        self.dependencies.entry(id).or_default();
        self.membership_changed = true;
        Ok(node)
    }

    /// Detach and return a node; the caller tears it down
    pub fn remove(&mut self, id: &str) -> Result<Node, GraphError> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;

        if let Some(deps) = self.dependencies.remove(id) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(id);
                }
            }
        }
        if let Some(users) = self.dependents.remove(id) {
            for user in users {
                if let Some(set) = self.dependencies.get_mut(&user) {
                    set.remove(id);
                }
            }
        }

        self.stale.remove(id);
        self.membership_changed = true;
        Ok(node)
    }

    /// Recompute the outgoing edges of every stale node.
    ///
    /// Returns whether the edge set or the node set changed since the last
    /// call, i.e. whether the evaluation order must be recomputed. On error
    /// no edge is modified.
    pub fn resolve_edges(&mut self) -> Result<bool, GraphError> {
        let targets: Vec<String> = if self.membership_changed {
            self.nodes.keys().cloned().collect()
        } else {
            self.stale.iter().cloned().collect()
        };

        let mut computed = Vec::with_capacity(targets.len());
        for id in targets {
            if let Some(node) = self.nodes.get(&id) {
                let deps = self.references_of(node)?;
                computed.push((id, deps));
            }
        }

        let mut changed = self.membership_changed;
        for (id, deps) in computed {
            if self.dependencies.get(&id) != Some(&deps) {
                changed = true;
                self.dependencies.insert(id, deps);
            }
        }

        if changed {
            self.dependents.clear();
            for (id, deps) in &self.dependencies {
                for dep in deps {
                    self.dependents
                        .entry(dep.clone())
                        .or_default()
                        .insert(id.clone());
                }
            }
        }

        self.stale.clear();
        self.membership_changed = false;
        Ok(changed)
    }

    fn references_of(&self, node: &Node) -> Result<BTreeSet<String>, GraphError> {
        node.program()
            .references()
            .iter()
            .map(|path| {
                let parts: Vec<&str> = path.iter().map(String::as_str).collect();
                resolve_reference(&parts, |id| self.nodes.contains_key(id))
                    .map(|(id, _)| id)
                    .ok_or_else(|| GraphError::UnknownReference {
                        node: node.id().to_string(),
                        reference: path.join("."),
                    })
            })
            .collect()
    }

    /// Every node, dependencies before dependents, ties broken by identity
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        topological_sort(&self.dependencies)
    }

    pub fn direct_dependencies(&self, id: &str) -> Vec<String> {
        self.dependencies
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn direct_dependents(&self, id: &str) -> Vec<String> {
        self.dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Everything that reads any of `ids`, directly or through other nodes
    pub fn transitive_dependents<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<String> = ids.into_iter().map(str::to_string).collect();
        while let Some(id) = queue.pop() {
            for dependent in self.direct_dependents(&id) {
                if seen.insert(dependent.clone()) {
                    queue.push(dependent);
                }
            }
        }
        seen
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Clone every node handle, e.g. to build an evaluation scope
    pub fn snapshot(&self) -> BTreeMap<String, Node> {
        self.nodes.clone()
    }
}

/// Map a reference's leading names to the node it reads.
///
/// The node is the one whose identity is the longest dotted prefix of
/// `path`; returns its identity and how many names it consumed.
pub fn resolve_reference(
    path: &[&str],
    contains: impl Fn(&str) -> bool,
) -> Option<(String, usize)> {
    (1..=path.len()).rev().find_map(|len| {
        let candidate = path[..len].join(".");
        contains(&candidate).then_some((candidate, len))
    })
}

/// Depth-first post-order over `dependencies`, visiting identities in
/// string order so the result is deterministic
pub fn topological_sort(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, GraphError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        dependencies: &'a BTreeMap<String, BTreeSet<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(id.to_string());
                return Err(GraphError::Cycle { path });
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(deps) = dependencies.get(id) {
            for dep in deps {
                visit(dep, dependencies, marks, stack, order)?;
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        order.push(id.to_string());
        Ok(())
    }

    let mut marks = HashMap::with_capacity(dependencies.len());
    let mut stack = Vec::new();
    let mut order = Vec::with_capacity(dependencies.len());
    for id in dependencies.keys() {
        visit(id, dependencies, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}
