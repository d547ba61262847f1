//! Storage collaborator interface.
//!
//! The runtime never owns nodes. It asks a [`Storage`] implementation to lift
//! them and to apply edits, receiving fresh [`Node`] snapshots back. Schema
//! errors raised by the store propagate unchanged; deprecations are reported
//! through the `warns` sink so the runtime can forward them as events.

mod memory;

use std::sync::Arc;

use crate::error::Result;
use crate::model::Model;
use crate::node::Node;
use crate::prim::Prim;

pub use memory::MemoryStore;

/// Lazy sequence of nodes produced by a lift.
pub type NodeIter = Box<dyn Iterator<Item = Result<Node>> + Send>;

/// Non-fatal deprecation condition raised while applying an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deprecation {
    /// Deprecated form or property name.
    pub name: String,
    /// Human readable warning.
    pub mesg: String,
}

impl Deprecation {
    pub(crate) fn form(form: &str) -> Self {
        Self {
            name: form.into(),
            mesg: format!("The form {form} is deprecated"),
        }
    }

    pub(crate) fn prop(full: &str) -> Self {
        Self {
            name: full.into(),
            mesg: format!("The property {full} is deprecated or using a deprecated type"),
        }
    }
}

/// Graph storage consumed by the runtime.
///
/// Comparator operands and edit values arrive un-normalized; implementations
/// normalize them against [`Storage::model`].
pub trait Storage: Send + Sync {
    /// Current data model snapshot.
    fn model(&self) -> Arc<Model>;

    /// Every node of `form`.
    fn lift_form(&self, form: &str) -> Result<NodeIter>;

    /// Nodes by full property name, optionally compared against a value.
    fn lift_prop(&self, prop: &str, cmp: Option<(&str, &Prim)>) -> Result<NodeIter>;

    /// Nodes whose array property has at least one element matching.
    fn lift_prop_array(&self, prop: &str, cmpr: &str, valu: &Prim) -> Result<NodeIter>;

    /// Nodes carrying a tag (wildcard segments allowed), optionally restricted to a
    /// form and compared on the tag interval.
    fn lift_tag(&self, tag: &str, form: Option<&str>, cmp: Option<(&str, &Prim)>)
        -> Result<NodeIter>;

    /// Node by identity. `valu` is normalized by the form type first.
    fn get_node(&self, form: &str, valu: &Prim) -> Result<Option<Node>>;

    /// Creates a node, returning the existing one if already present.
    fn add_node(&self, form: &str, valu: &Prim, warns: &mut Vec<Deprecation>) -> Result<Node>;

    /// Sets a secondary property.
    fn set_prop(&self, node: &Node, prop: &str, valu: &Prim, warns: &mut Vec<Deprecation>)
        -> Result<Node>;

    /// Removes a secondary property. Absent values are left alone.
    fn del_prop(&self, node: &Node, prop: &str) -> Result<Node>;

    /// Sets a universal property.
    fn set_univ(&self, node: &Node, univ: &str, valu: &Prim, warns: &mut Vec<Deprecation>)
        -> Result<Node>;

    /// Removes a universal property. Absent values are left alone.
    fn del_univ(&self, node: &Node, univ: &str) -> Result<Node>;

    /// Applies a tag and its ancestors, merging any interval.
    fn add_tag(&self, node: &Node, tag: &str, ival: Option<&Prim>, warns: &mut Vec<Deprecation>)
        -> Result<Node>;

    /// Removes a tag and its descendants.
    fn del_tag(&self, node: &Node, tag: &str) -> Result<Node>;

    /// Sets a tag property, applying the tag if needed.
    fn set_tag_prop(
        &self,
        node: &Node,
        tag: &str,
        prop: &str,
        valu: &Prim,
        warns: &mut Vec<Deprecation>,
    ) -> Result<Node>;

    /// Removes a tag property.
    fn del_tag_prop(&self, node: &Node, tag: &str, prop: &str) -> Result<Node>;
}

/// Segment-wise tag match where `*` matches exactly one segment.
pub fn tag_glob_matches(pattern: &str, tag: &str) -> bool {
    let mut want = pattern.split('.');
    let mut have = tag.split('.');
    loop {
        match (want.next(), have.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {}
            (Some(w), Some(h)) if w == h => {}
            _ => return false,
        }
    }
}

/// Normalizes a tag name: strips `#`, lowercases, and rejects empty segments.
pub fn norm_tag(tag: &str) -> Result<String> {
    let body = tag.strip_prefix('#').unwrap_or(tag).trim().to_lowercase();
    if body.is_empty() || body.split('.').any(|seg| seg.is_empty()) {
        return Err(crate::error::StormError::bad_valu("syn:tag", tag, "invalid tag name"));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs_match_single_segments() {
        assert!(tag_glob_matches("base.*", "base.tag1"));
        assert!(tag_glob_matches("base.*.foo", "base.tag1.foo"));
        assert!(!tag_glob_matches("base.*", "base"));
        assert!(!tag_glob_matches("base.*", "base.tag1.foo"));
        assert!(tag_glob_matches("base.tag1", "base.tag1"));
    }

    #[test]
    fn tag_names_normalize() {
        assert_eq!(norm_tag("#Foo.Bar").ok(), Some("foo.bar".to_owned()));
        assert!(norm_tag("#foo..bar").is_err());
        assert!(norm_tag("#").is_err());
    }
}
