//! # Record Tree
//!
//! Sparse nested mapping keyed by dimension values in dimension order. The
//! final level holds a flat metric map. Merges coalesce: a path that already
//! has a leaf gains metrics instead of growing a second leaf.

use crate::error::FlushError;
use crate::model::{Key, Row, TableSchema, Value};
use anyhow::{anyhow, bail, Result};
use hashbrown::HashMap;
use std::collections::BTreeMap;

type Level = HashMap<Key, Node>;

/// A node of the record tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Branch(Level),
    Leaf(HashMap<String, Value>),
}

/// In-memory accumulation of records prior to a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordTree {
    depth: usize,
    root: Level,
}

impl RecordTree {
    /// Create an empty tree whose leaves sit `depth` levels below the root.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            root: HashMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Set `metric` on the leaf at `path`, creating the path as needed.
    /// Other metrics already on the leaf are kept.
    pub fn merge(&mut self, path: &[Key], metric: &str, value: Value) -> Result<()> {
        if path.len() != self.depth {
            bail!(
                "path of length {} does not match tree depth {}",
                path.len(),
                self.depth
            );
        }
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| anyhow!("empty path"))?;

        let mut level = &mut self.root;
        for (index, key) in parents.iter().enumerate() {
            let node = level
                .entry(key.clone())
                .or_insert_with(|| Node::Branch(HashMap::new()));
            level = match node {
                Node::Branch(children) => children,
                Node::Leaf(_) => bail!("leaf found at depth {} under {key}", index + 1),
            };
        }

        match level
            .entry(last.clone())
            .or_insert_with(|| Node::Leaf(HashMap::new()))
        {
            Node::Leaf(metrics) => {
                metrics.insert(metric.to_string(), value);
                Ok(())
            }
            Node::Branch(_) => bail!("branch found where leaf {last} was expected"),
        }
    }

    /// Look up the leaf metrics at `path`.
    pub fn leaf(&self, path: &[Key]) -> Option<&HashMap<String, Value>> {
        let (last, parents) = path.split_last()?;
        let mut level = &self.root;
        for key in parents {
            match level.get(key)? {
                Node::Branch(children) => level = children,
                Node::Leaf(_) => return None,
            }
        }
        match level.get(last)? {
            Node::Leaf(metrics) => Some(metrics),
            Node::Branch(_) => None,
        }
    }

    /// Drop the node at `path` together with any branch it leaves empty.
    /// Returns whether anything was removed.
    pub fn remove(&mut self, path: &[Key]) -> bool {
        fn prune(level: &mut Level, path: &[Key]) -> bool {
            let Some((first, rest)) = path.split_first() else {
                return false;
            };
            if rest.is_empty() {
                return level.remove(first).is_some();
            }
            let (removed, now_empty) = match level.get_mut(first) {
                Some(Node::Branch(children)) => {
                    let removed = prune(children, rest);
                    (removed, children.is_empty())
                }
                _ => (false, false),
            };
            if removed && now_empty {
                level.remove(first);
            }
            removed
        }
        prune(&mut self.root, path)
    }

    /// Build a tree from an equivalent nested structure: objects whose values
    /// are all objects become branches, objects of scalars become leaves.
    ///
    /// Depth is not checked here. A flush rejects a mis-shaped tree before
    /// any store access.
    pub fn from_json(depth: usize, value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("record tree root must be an object"))?;
        let mut tree = Self::new(depth);
        tree.root = level_from_json(object, &mut Vec::new())?;
        Ok(tree)
    }

    /// Number of leaves, i.e. rows a flush would produce.
    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&Level> = vec![&self.root];
        while let Some(level) = stack.pop() {
            for node in level.values() {
                match node {
                    Node::Branch(children) => stack.push(children),
                    Node::Leaf(_) => count += 1,
                }
            }
        }
        count
    }

    /// Flatten every root-to-leaf path into a [`Row`].
    ///
    /// Each path is visited once, using an explicit stack of
    /// `(path so far, subtree)` frames. Metrics declared by `schema` but
    /// missing from a leaf come out as [`Value::Null`]; leaf entries the
    /// schema does not declare are not carried. Sibling order is unspecified.
    pub fn rows(&self, schema: &TableSchema) -> Result<Vec<Row>, FlushError> {
        let depth = schema.depth();
        let mut rows = Vec::new();
        let mut stack: Vec<(Vec<Key>, &Level)> = vec![(Vec::new(), &self.root)];

        while let Some((prefix, level)) = stack.pop() {
            for (key, node) in level {
                let mut path = Vec::with_capacity(prefix.len() + 1);
                path.extend(prefix.iter().cloned());
                path.push(key.clone());

                match node {
                    Node::Branch(children) => {
                        if children.is_empty() {
                            continue;
                        }
                        if path.len() >= depth {
                            return Err(FlushError::MalformedTree {
                                path,
                                expected_depth: depth,
                            });
                        }
                        stack.push((path, children));
                    }
                    Node::Leaf(metrics) => {
                        if path.len() != depth {
                            return Err(FlushError::MalformedTree {
                                path,
                                expected_depth: depth,
                            });
                        }
                        rows.push(materialize(path, metrics, schema));
                    }
                }
            }
        }

        Ok(rows)
    }
}

fn materialize(path: Vec<Key>, leaf: &HashMap<String, Value>, schema: &TableSchema) -> Row {
    let metrics: BTreeMap<String, Value> = schema
        .metrics()
        .iter()
        .map(|name| (name.clone(), leaf.get(name).cloned().unwrap_or_default()))
        .collect();
    Row::new(path, metrics)
}

fn level_from_json(
    object: &serde_json::Map<String, serde_json::Value>,
    path: &mut Vec<String>,
) -> Result<Level> {
    let mut level = HashMap::with_capacity(object.len());
    for (name, child) in object {
        path.push(name.clone());
        let node = match child.as_object() {
            Some(inner) if inner.is_empty() || inner.values().all(|v| v.is_object()) => {
                Node::Branch(level_from_json(inner, path)?)
            }
            Some(inner) if inner.values().any(|v| v.is_object()) => {
                bail!("node {} mixes nested objects and metrics", path.join("/"));
            }
            Some(inner) => {
                let mut metrics = HashMap::with_capacity(inner.len());
                for (metric, raw) in inner {
                    let value = Value::from_json(raw).ok_or_else(|| {
                        anyhow!("metric {metric} under {} is not a scalar", path.join("/"))
                    })?;
                    metrics.insert(metric.clone(), value);
                }
                Node::Leaf(metrics)
            }
            None => bail!("node {} is a scalar where a mapping was expected", path.join("/")),
        };
        path.pop();
        level.insert(Key::Text(name.clone()), node);
    }
    Ok(level)
}
