//! Graph node snapshots handed out by storage collaborators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::prim::Prim;

/// Validity interval attached to a tag, as `(min, max)` epoch milliseconds.
pub type Interval = (i64, i64);

/// Snapshot of a node: `(form, primary value)` plus its properties and tags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Form name, e.g. `inet:fqdn`.
    pub form: String,
    /// Normalized primary value.
    pub valu: Prim,
    /// Secondary properties keyed by relative name (`hehe`, not `test:str:hehe`).
    pub props: BTreeMap<String, Prim>,
    /// Universal properties keyed without the leading dot.
    pub univs: BTreeMap<String, Prim>,
    /// Tags, including every ancestor of each applied tag.
    pub tags: BTreeMap<String, Option<Interval>>,
    /// Tag properties keyed by `(tag, prop)`.
    pub tagprops: BTreeMap<(String, String), Prim>,
}

impl Node {
    /// Creates a bare node with no properties or tags.
    pub fn new(form: impl Into<String>, valu: Prim) -> Self {
        Self {
            form: form.into(),
            valu,
            props: BTreeMap::new(),
            univs: BTreeMap::new(),
            tags: BTreeMap::new(),
            tagprops: BTreeMap::new(),
        }
    }

    /// `(form, value)` identity pair.
    pub fn ndef(&self) -> (String, Prim) {
        (self.form.clone(), self.valu.clone())
    }

    /// Identity pair encoded as a primitive list.
    pub fn ndef_prim(&self) -> Prim {
        Prim::List(vec![Prim::Str(self.form.clone()), self.valu.clone()])
    }

    /// Secondary property by relative name.
    pub fn get(&self, prop: &str) -> Option<&Prim> {
        self.props.get(prop)
    }

    /// Whether the node carries `tag` (ancestors count).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    /// `form=value` rendering used by `repr()` and logs.
    pub fn repr(&self) -> String {
        format!("{}={}", self.form, self.valu)
    }
}
