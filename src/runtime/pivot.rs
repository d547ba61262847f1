//! Pivot operators.
//!
//! A pivot follows typed references between forms. Forward references are
//! property values whose type names a form (directly, as an array element, or
//! as an ndef pair); reverse references are found by lifting the destination
//! form's referencing properties by the source node's value.

use std::sync::Arc;

use tracing::trace;

use super::eval::{resolve_name, resolve_tag, Cx};
use super::runt::Runt;
use super::scope::Frame;
use super::stages::{BoxStage, Chain, Driven, Flow, NodeSource, Producer, Seed, Trigger};
use crate::ast::{Pivot, PivotDir, PivotTarget};
use crate::error::{Result, StormError};
use crate::model::{FormDef, Model};
use crate::node::Node;
use crate::prim::Prim;
use crate::profile::{profile_timer, record_profile_timer, StageKind};
use crate::storage::{tag_glob_matches, Storage};

/// Replaces every inbound node with the nodes it pivots to.
pub(crate) fn build_pivot(upstream: BoxStage, pivot: Arc<Pivot>, frame: Arc<Frame>) -> BoxStage {
    Driven::new(upstream, PivotProducer { pivot, frame }, Trigger::Each, false, false)
}

/// How a type refers to other nodes.
#[derive(Debug, Clone, Copy)]
enum RefKind<'m> {
    Form(&'m str),
    ArrayOf(&'m str),
    Ndef,
    ArrayNdef,
}

fn ref_kind<'m>(model: &'m Model, ty: &str) -> Option<RefKind<'m>> {
    if model.is_ndef(ty) {
        return Some(RefKind::Ndef);
    }
    if let Some(elem) = model.array_elem(ty) {
        if model.is_ndef(elem) {
            return Some(RefKind::ArrayNdef);
        }
        return model.form_of_type(elem).map(RefKind::ArrayOf);
    }
    model.form_of_type(ty).map(RefKind::Form)
}

fn ndef_parts(valu: &Prim) -> Option<(&str, &Prim)> {
    match valu.as_list()? {
        [Prim::Str(form), inner] => Some((form.as_str(), inner)),
        _ => None,
    }
}

fn wanted(dst: Option<&str>, form: &str) -> bool {
    dst.map_or(true, |dst| dst == form)
}

struct PivotProducer {
    pivot: Arc<Pivot>,
    frame: Arc<Frame>,
}

impl Producer for PivotProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> std::result::Result<Option<BoxStage>, Flow> {
        let Some(node) = node else {
            return Ok(None);
        };
        let timer = profile_timer();
        let cx = Cx::new(runt, &self.frame, Some(node));
        let stage = match &self.pivot.src {
            Some(_) => self.prop_pivot(node, &cx)?,
            None => self.form_pivot(node, &cx)?,
        };
        record_profile_timer(StageKind::Pivot, timer);
        trace!(node = %node.repr(), "storm.stage.pivot");
        Ok(Some(stage))
    }
}

impl PivotProducer {
    fn target_name(&self) -> String {
        match &self.pivot.target {
            PivotTarget::Any => "*".into(),
            PivotTarget::Form(form) => form.clone(),
            PivotTarget::Tags(_) => "syn:tag".into(),
        }
    }

    /// `:prop -> target`.
    fn prop_pivot(&self, node: &Node, cx: &Cx<'_>) -> Result<BoxStage> {
        let model = &cx.runt.model;
        let store = &cx.runt.store;
        let Some(src) = &self.pivot.src else {
            return Ok(Seed::empty());
        };
        let name = resolve_name(&src.name, cx)?;
        let (full, ty, valu) = if src.univ {
            let def = model.req_univ(&name)?;
            (def.full.clone(), def.ty.clone(), node.univs.get(&name))
        } else {
            let def = model.req_prop(&node.form, &name)?;
            (def.full.clone(), def.ty.clone(), node.props.get(&name))
        };
        let dst = match &self.pivot.target {
            _ if self.pivot.dir == PivotDir::In => None,
            PivotTarget::Tags(_) => None,
            PivotTarget::Any => Some(None),
            PivotTarget::Form(form) => {
                model.req_form(form)?;
                Some(Some(form.as_str()))
            }
        };
        let Some(dst) = dst else {
            return Err(StormError::NoSuchPivot {
                src: full,
                dst: self.target_name(),
            });
        };
        let Some(valu) = valu else {
            return Ok(Seed::empty());
        };

        let mut nodes = Vec::new();
        let items: Vec<&Prim> = match model.array_elem(&ty) {
            Some(_) => valu.as_list().map(|items| items.iter().collect()).unwrap_or_default(),
            None => vec![valu],
        };
        let elem_ty = model.array_elem(&ty).unwrap_or(&ty).to_owned();
        for item in items {
            let found = if model.is_ndef(&elem_ty) {
                match ndef_parts(item) {
                    Some((form, inner)) if wanted(dst, form) => store.get_node(form, inner)?,
                    _ => None,
                }
            } else {
                match (model.form_of_type(&elem_ty), dst) {
                    (Some(form), None) => store.get_node(form, item)?,
                    (_, Some(form)) => store.get_node(form, item)?,
                    (None, None) => None,
                }
            };
            nodes.extend(found);
        }
        Ok(Seed::new(nodes))
    }

    /// `-> target` / `<- target` from the node itself.
    fn form_pivot(&self, node: &Node, cx: &Cx<'_>) -> Result<BoxStage> {
        let runt = cx.runt;
        let model = &runt.model;
        let store = runt.store.as_ref();
        match (&self.pivot.target, self.pivot.dir) {
            (PivotTarget::Tags(tag), PivotDir::Out) => {
                let pattern = resolve_tag(tag, cx)?;
                let glob = pattern.contains('*');
                let mut nodes = Vec::new();
                for name in node.tags.keys() {
                    let hit = if glob {
                        tag_glob_matches(&pattern, name)
                    } else {
                        *name == pattern
                    };
                    if hit {
                        nodes.extend(store.get_node("syn:tag", &Prim::Str(name.clone()))?);
                    }
                }
                Ok(Seed::new(nodes))
            }
            (PivotTarget::Tags(_), PivotDir::In) => Err(StormError::NoSuchPivot {
                src: node.form.clone(),
                dst: self.target_name(),
            }),
            (PivotTarget::Any, PivotDir::Out) => {
                let forward = forward(model, store, node, None)?;
                Ok(Seed::new(forward))
            }
            (PivotTarget::Any, PivotDir::In) => {
                let mut parts = Vec::new();
                for form in model.forms() {
                    reverse(model, store, node, form, &mut parts)?;
                }
                Ok(Chain::new(parts))
            }
            (PivotTarget::Form(dst), dir) => {
                let dstdef = model.req_form(dst)?;
                let srcdef = model.req_form(&node.form)?;
                let (from, to) = match dir {
                    PivotDir::Out => (srcdef, dstdef),
                    PivotDir::In => (dstdef, srcdef),
                };
                if !refers(model, from, &to.name) && !refers(model, to, &from.name) {
                    return Err(StormError::NoSuchPivot {
                        src: node.form.clone(),
                        dst: dst.clone(),
                    });
                }
                let mut parts = Vec::new();
                match dir {
                    PivotDir::Out => {
                        parts.push(Seed::new(forward(model, store, node, Some(dst))?));
                        reverse(model, store, node, dstdef, &mut parts)?;
                    }
                    PivotDir::In => {
                        reverse(model, store, node, dstdef, &mut parts)?;
                    }
                }
                Ok(Chain::new(parts))
            }
        }
    }
}

/// Whether any property of `form` can reference nodes of `dst`.
fn refers(model: &Model, form: &FormDef, dst: &str) -> bool {
    form.props.values().any(|def| match ref_kind(model, &def.ty) {
        Some(RefKind::Form(to) | RefKind::ArrayOf(to)) => to == dst,
        Some(RefKind::Ndef | RefKind::ArrayNdef) => true,
        None => false,
    })
}

/// Nodes the source node's own properties point at.
fn forward(model: &Model, store: &dyn Storage, node: &Node, dst: Option<&str>) -> Result<Vec<Node>> {
    let form = model.req_form(&node.form)?;
    let univs = node
        .univs
        .iter()
        .filter_map(|(name, valu)| model.univ(name).map(|def| (def, valu)));
    let props = node
        .props
        .iter()
        .filter_map(|(name, valu)| form.props.get(name).map(|def| (def, valu)));
    let mut out = Vec::new();
    for (def, valu) in props.chain(univs) {
        match ref_kind(model, &def.ty) {
            Some(RefKind::Form(to)) if wanted(dst, to) => out.extend(store.get_node(to, valu)?),
            Some(RefKind::ArrayOf(to)) if wanted(dst, to) => {
                for item in valu.as_list().unwrap_or_default() {
                    out.extend(store.get_node(to, item)?);
                }
            }
            Some(RefKind::Ndef) => {
                if let Some((to, inner)) = ndef_parts(valu).filter(|(to, _)| wanted(dst, to)) {
                    out.extend(store.get_node(to, inner)?);
                }
            }
            Some(RefKind::ArrayNdef) => {
                for item in valu.as_list().unwrap_or_default() {
                    if let Some((to, inner)) = ndef_parts(item).filter(|(to, _)| wanted(dst, to)) {
                        out.extend(store.get_node(to, inner)?);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Lifts the nodes of `form` whose properties point at `node`.
fn reverse(model: &Model, store: &dyn Storage, node: &Node, form: &FormDef, parts: &mut Vec<BoxStage>) -> Result<()> {
    let ndef = node.ndef_prim();
    for def in form.props.values() {
        let iter = match ref_kind(model, &def.ty) {
            Some(RefKind::Form(to)) if to == node.form => {
                store.lift_prop(&def.full, Some(("=", &node.valu)))?
            }
            Some(RefKind::ArrayOf(to)) if to == node.form => {
                store.lift_prop_array(&def.full, "=", &node.valu)?
            }
            Some(RefKind::Ndef) => store.lift_prop(&def.full, Some(("=", &ndef)))?,
            Some(RefKind::ArrayNdef) => store.lift_prop_array(&def.full, "=", &ndef)?,
            _ => continue,
        };
        parts.push(NodeSource::new(iter, StageKind::Pivot));
    }
    Ok(())
}
