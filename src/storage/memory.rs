//! In-memory [`Storage`] implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{norm_tag, tag_glob_matches, Deprecation, NodeIter, Storage};
use crate::error::{Result, StormError};
use crate::model::{time::now_millis, Base, Matcher, Model, PropTarget};
use crate::node::Node;
use crate::prim::Prim;

type NodeKey = (String, Prim);
type NodeMap = BTreeMap<NodeKey, Node>;

/// Thread-safe node store backed by an ordered map.
///
/// Lifts iterate a snapshot taken when the lift starts, ordered by
/// `(form, value)`. Model changes swap in a new [`Model`] snapshot so running
/// lifts keep the model they started with.
pub struct MemoryStore {
    model: RwLock<Arc<Model>>,
    nodes: RwLock<NodeMap>,
}

impl MemoryStore {
    /// Creates an empty store over `model`.
    pub fn new(model: Model) -> Self {
        Self {
            model: RwLock::new(Arc::new(model)),
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Applies a schema change. On error the previous model stays in place.
    pub fn update_model<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Model) -> Result<()>,
    {
        let mut guard = self.model.write();
        let mut next = Model::clone(&guard);
        change(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn snapshot<F>(&self, form: Option<&str>, mut keep: F) -> NodeIter
    where
        F: FnMut(&Node) -> bool,
    {
        let nodes = self.nodes.read();
        let hits: Vec<Node> = match form {
            Some(form) => nodes
                .range((form.to_owned(), Prim::Null)..)
                .take_while(|((name, _), _)| name == form)
                .map(|(_, node)| node)
                .filter(|node| keep(node))
                .cloned()
                .collect(),
            None => nodes.values().filter(|node| keep(node)).cloned().collect(),
        };
        Box::new(hits.into_iter().map(Ok))
    }

    fn edit<F>(&self, node: &Node, apply: F) -> Result<Node>
    where
        F: FnOnce(&Model, &mut NodeMap, &mut Node) -> Result<Vec<(String, Prim)>>,
    {
        let model = self.model();
        let mut nodes = self.nodes.write();
        let key = (node.form.clone(), node.valu.clone());
        let mut current = nodes
            .get(&key)
            .cloned()
            .ok_or_else(|| StormError::runtime(format!("node {} no longer exists", node.repr())))?;
        let refs = apply(&model, &mut nodes, &mut current)?;
        nodes.insert(key, current.clone());
        let mut warns = Vec::new();
        for (form, valu) in refs {
            create(&model, &mut nodes, &form, &valu, &mut warns)?;
        }
        Ok(current)
    }
}

fn create(
    model: &Model,
    nodes: &mut NodeMap,
    form: &str,
    valu: &Prim,
    warns: &mut Vec<Deprecation>,
) -> Result<Node> {
    let formdef = model.req_form(form)?;
    let norm = model.norm(form, valu)?;
    let key = (form.to_owned(), norm.clone());
    if let Some(node) = nodes.get(&key) {
        return Ok(node.clone());
    }
    if model.form_deprecated(formdef) {
        warns.push(Deprecation::form(form));
    }
    let mut node = Node::new(form, norm.clone());
    node.univs
        .insert("created".into(), Prim::Int(now_millis()));
    let mut refs = Vec::new();

    let typedef = model.req_type(form)?;
    if typedef.base == Base::Comp {
        if let Prim::List(items) = &norm {
            for ((field, _), item) in typedef.opts.fields.iter().zip(items) {
                if let Some(prop) = formdef.props.get(field) {
                    let valu = model.norm(&prop.ty, item)?;
                    refs.extend(node_refs(model, &prop.ty, &valu));
                    node.props.insert(field.clone(), valu);
                }
            }
        }
    }
    if form == "syn:tag" {
        if let Prim::Str(tag) = &norm {
            let depth = tag.matches('.').count() as i64;
            let base = tag.rsplit('.').next().unwrap_or(tag.as_str()).to_owned();
            node.props.insert("depth".into(), Prim::Int(depth));
            node.props.insert("base".into(), Prim::Str(base));
            if let Some((up, _)) = tag.rsplit_once('.') {
                node.props.insert("up".into(), Prim::Str(up.to_owned()));
                refs.push(("syn:tag".into(), Prim::Str(up.to_owned())));
            }
        }
    }
    debug!(node = %node.repr(), "storm.store.add_node");
    nodes.insert(key, node.clone());
    for (form, valu) in refs {
        create(model, nodes, &form, &valu, warns)?;
    }
    Ok(node)
}

/// Nodes a normalized value of type `ty` points at.
fn node_refs(model: &Model, ty: &str, valu: &Prim) -> Vec<(String, Prim)> {
    if let Some(form) = model.form_of_type(ty) {
        return vec![(form.to_owned(), valu.clone())];
    }
    if let Some(elem) = model.array_elem(ty) {
        return valu
            .as_list()
            .unwrap_or_default()
            .iter()
            .flat_map(|item| node_refs(model, elem, item))
            .collect();
    }
    if model.is_ndef(ty) {
        if let Some([Prim::Str(form), inner]) = valu.as_list() {
            return vec![(form.clone(), inner.clone())];
        }
    }
    Vec::new()
}

fn array_elem_type(model: &Model, prop: &str, ty: &str) -> Result<String> {
    model
        .array_elem(ty)
        .map(str::to_owned)
        .ok_or_else(|| StormError::BadCmprType {
            name: prop.into(),
            cmpr: "*[]".into(),
            mesg: format!("Array filter syntax is only valid on array types, {prop} is not"),
        })
}

fn tag_ancestors(tag: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = String::new();
    for seg in tag.split('.') {
        if !cursor.is_empty() {
            cursor.push('.');
        }
        cursor.push_str(seg);
        out.push(cursor.clone());
    }
    out
}

impl Storage for MemoryStore {
    fn model(&self) -> Arc<Model> {
        Arc::clone(&self.model.read())
    }

    fn lift_form(&self, form: &str) -> Result<NodeIter> {
        self.model().req_form(form)?;
        Ok(self.snapshot(Some(form), |_| true))
    }

    fn lift_prop(&self, prop: &str, cmp: Option<(&str, &Prim)>) -> Result<NodeIter> {
        let model = self.model();
        match model.resolve(prop)? {
            PropTarget::Primary(form) => {
                let matcher = cmp
                    .map(|(cmpr, valu)| model.matcher(&form.name, cmpr, valu))
                    .transpose()?;
                Ok(self.snapshot(Some(&form.name), move |node| {
                    matcher.as_ref().map_or(true, |m| m.matches(&node.valu))
                }))
            }
            PropTarget::Prop(form, def) => {
                let matcher = cmp
                    .map(|(cmpr, valu)| model.matcher(&def.ty, cmpr, valu))
                    .transpose()?;
                let name = def.name.clone();
                Ok(self.snapshot(Some(&form.name), move |node| {
                    node.props
                        .get(&name)
                        .is_some_and(|have| matcher.as_ref().map_or(true, |m| m.matches(have)))
                }))
            }
            PropTarget::Univ(form, def) => {
                let matcher = cmp
                    .map(|(cmpr, valu)| model.matcher(&def.ty, cmpr, valu))
                    .transpose()?;
                let name = def.name.clone();
                Ok(self.snapshot(form.map(|f| f.name.as_str()), move |node| {
                    node.univs
                        .get(&name)
                        .is_some_and(|have| matcher.as_ref().map_or(true, |m| m.matches(have)))
                }))
            }
        }
    }

    fn lift_prop_array(&self, prop: &str, cmpr: &str, valu: &Prim) -> Result<NodeIter> {
        let model = self.model();
        let (form, name, ty, univ) = match model.resolve(prop)? {
            PropTarget::Prop(form, def) => (Some(form.name.clone()), def.name.clone(), def.ty.clone(), false),
            PropTarget::Univ(form, def) => (
                form.map(|f| f.name.clone()),
                def.name.clone(),
                def.ty.clone(),
                true,
            ),
            PropTarget::Primary(form) => (None, String::new(), form.name.clone(), false),
        };
        let elem = array_elem_type(&model, prop, &ty)?;
        let matcher: Matcher = model.matcher(&elem, cmpr, valu)?;
        Ok(self.snapshot(form.as_deref(), move |node| {
            let have = if univ {
                node.univs.get(&name)
            } else {
                node.props.get(&name)
            };
            have.and_then(Prim::as_list)
                .is_some_and(|items| items.iter().any(|item| matcher.matches(item)))
        }))
    }

    fn lift_tag(
        &self,
        tag: &str,
        form: Option<&str>,
        cmp: Option<(&str, &Prim)>,
    ) -> Result<NodeIter> {
        let model = self.model();
        if let Some(form) = form {
            model.req_form(form)?;
        }
        let pattern = tag.strip_prefix('#').unwrap_or(tag).to_lowercase();
        let matcher = cmp
            .map(|(cmpr, valu)| model.matcher("ival", cmpr, valu))
            .transpose()?;
        let glob = pattern.contains('*');
        Ok(self.snapshot(form, move |node| {
            node.tags.iter().any(|(name, ival)| {
                let named = if glob {
                    tag_glob_matches(&pattern, name)
                } else {
                    *name == pattern
                };
                named
                    && match &matcher {
                        None => true,
                        Some(m) => ival.is_some_and(|(lo, hi)| {
                            m.matches(&Prim::List(vec![Prim::Int(lo), Prim::Int(hi)]))
                        }),
                    }
            })
        }))
    }

    fn get_node(&self, form: &str, valu: &Prim) -> Result<Option<Node>> {
        let model = self.model();
        model.req_form(form)?;
        let norm = model.norm(form, valu)?;
        Ok(self.nodes.read().get(&(form.to_owned(), norm)).cloned())
    }

    fn add_node(&self, form: &str, valu: &Prim, warns: &mut Vec<Deprecation>) -> Result<Node> {
        let model = self.model();
        let mut nodes = self.nodes.write();
        create(&model, &mut nodes, form, valu, warns)
    }

    fn set_prop(
        &self,
        node: &Node,
        prop: &str,
        valu: &Prim,
        warns: &mut Vec<Deprecation>,
    ) -> Result<Node> {
        let model = self.model();
        let def = model.req_prop(&node.form, prop)?;
        let norm = model.norm(&def.ty, valu)?;
        if model.prop_deprecated(def) {
            warns.push(Deprecation::prop(&def.full));
        }
        let ty = def.ty.clone();
        let name = def.name.clone();
        self.edit(node, move |model, _, current| {
            let refs = node_refs(model, &ty, &norm);
            current.props.insert(name, norm);
            Ok(refs)
        })
    }

    fn del_prop(&self, node: &Node, prop: &str) -> Result<Node> {
        self.model().req_prop(&node.form, prop)?;
        let name = prop.to_owned();
        self.edit(node, move |_, _, current| {
            current.props.remove(&name);
            Ok(Vec::new())
        })
    }

    fn set_univ(
        &self,
        node: &Node,
        univ: &str,
        valu: &Prim,
        warns: &mut Vec<Deprecation>,
    ) -> Result<Node> {
        let model = self.model();
        let def = model.req_univ(univ)?;
        let norm = model.norm(&def.ty, valu)?;
        if model.prop_deprecated(def) {
            warns.push(Deprecation::prop(&format!("{}.{}", node.form, def.name)));
        }
        let ty = def.ty.clone();
        let name = def.name.clone();
        self.edit(node, move |model, _, current| {
            let refs = node_refs(model, &ty, &norm);
            current.univs.insert(name, norm);
            Ok(refs)
        })
    }

    fn del_univ(&self, node: &Node, univ: &str) -> Result<Node> {
        self.model().req_univ(univ)?;
        let name = univ.to_owned();
        self.edit(node, move |_, _, current| {
            current.univs.remove(&name);
            Ok(Vec::new())
        })
    }

    fn add_tag(
        &self,
        node: &Node,
        tag: &str,
        ival: Option<&Prim>,
        _warns: &mut Vec<Deprecation>,
    ) -> Result<Node> {
        let model = self.model();
        let tag = norm_tag(tag)?;
        let ival = match ival {
            Some(valu) => match model.norm("ival", valu)? {
                Prim::List(pair) => match pair.as_slice() {
                    [Prim::Int(lo), Prim::Int(hi)] => Some((*lo, *hi)),
                    _ => None,
                },
                _ => None,
            },
            None => None,
        };
        self.edit(node, move |_, _, current| {
            let names = tag_ancestors(&tag);
            let mut refs = Vec::with_capacity(names.len());
            for name in names {
                let merged = match (current.tags.get(&name).copied().flatten(), ival) {
                    (Some((lo, hi)), Some((nlo, nhi))) if name == tag => Some((lo.min(nlo), hi.max(nhi))),
                    (_, Some(new)) if name == tag => Some(new),
                    (old, _) => old,
                };
                current.tags.insert(name.clone(), merged);
                refs.push(("syn:tag".to_owned(), Prim::Str(name)));
            }
            Ok(refs)
        })
    }

    fn del_tag(&self, node: &Node, tag: &str) -> Result<Node> {
        let tag = norm_tag(tag)?;
        self.edit(node, move |_, _, current| {
            let child = format!("{tag}.");
            current
                .tags
                .retain(|name, _| *name != tag && !name.starts_with(&child));
            current
                .tagprops
                .retain(|(name, _), _| *name != tag && !name.starts_with(&child));
            Ok(Vec::new())
        })
    }

    fn set_tag_prop(
        &self,
        node: &Node,
        tag: &str,
        prop: &str,
        valu: &Prim,
        warns: &mut Vec<Deprecation>,
    ) -> Result<Node> {
        let model = self.model();
        let def = model.tag_prop(prop).ok_or_else(|| StormError::NoSuchProp {
            name: format!("#{tag}:{prop}"),
        })?;
        let norm = model.norm(&def.ty, valu)?;
        if model.prop_deprecated(def) {
            warns.push(Deprecation::prop(&format!("#{tag}:{prop}")));
        }
        let node = if node.has_tag(&norm_tag(tag)?) {
            node.clone()
        } else {
            self.add_tag(node, tag, None, warns)?
        };
        let tag = norm_tag(tag)?;
        let prop = prop.to_owned();
        self.edit(&node, move |_, _, current| {
            current.tagprops.insert((tag, prop), norm);
            Ok(Vec::new())
        })
    }

    fn del_tag_prop(&self, node: &Node, tag: &str, prop: &str) -> Result<Node> {
        let model = self.model();
        if model.tag_prop(prop).is_none() {
            return Err(StormError::NoSuchProp {
                name: format!("#{tag}:{prop}"),
            });
        }
        let key = (norm_tag(tag)?, prop.to_owned());
        self.edit(node, move |_, _, current| {
            current.tagprops.remove(&key);
            Ok(Vec::new())
        })
    }
}
