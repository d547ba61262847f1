//! Node edit operators.

use std::sync::Arc;

use tracing::trace;

use super::eval::{eval, resolve_name, resolve_tag, Cx};
use super::runt::Runt;
use super::scope::Frame;
use super::stages::{BoxStage, Driven, Flow, Producer, Pull, Seed, Stage, Trigger};
use crate::ast::{Edit, EditParens, NodeAdd, PropSet, TagMatch};
use crate::error::{Result, StormError};
use crate::node::Node;
use crate::prim::Prim;
use crate::profile::{profile_timer, record_profile_timer, StageKind};
use crate::value::Value;

/// Chains the stages for an edit block's operators, in order.
pub(crate) fn build_edits(upstream: BoxStage, edits: &[Edit], frame: &Arc<Frame>) -> BoxStage {
    let mut stage = upstream;
    for edit in edits {
        let frame = Arc::clone(frame);
        stage = match edit {
            Edit::NodeAdd(add) => {
                let runtsafe = add.value.is_runtsafe();
                let producer = NodeAddProducer {
                    add: Arc::clone(add),
                    frame,
                };
                Driven::new(stage, producer, Trigger::Produce, runtsafe, true)
            }
            Edit::Parens(parens) => {
                let runtsafe = parens.add.value.is_runtsafe();
                let producer = ParensProducer {
                    parens: Arc::clone(parens),
                    frame,
                };
                Driven::new(stage, producer, Trigger::Produce, runtsafe, true)
            }
            other => Box::new(EditStage {
                upstream: stage,
                edit: other.clone(),
                frame,
            }),
        };
    }
    stage
}

/// Whether a normalization failure on a `?=` edit should skip it.
fn skippable(err: &StormError, try_set: bool) -> bool {
    try_set && matches!(err, StormError::BadTypeValu { .. })
}

/// Creates (or selects) the node a `form=value` edit names. `None` means a
/// try-set edit skipped a bad value.
fn create(add: &NodeAdd, runt: &Runt, frame: &Arc<Frame>, node: Option<&Node>) -> Result<Option<Node>> {
    let timer = profile_timer();
    let cx = Cx::new(runt, frame, node);
    let valu = eval(&add.value, &cx)?;
    let prim = match valu.to_prim() {
        Ok(prim) => prim,
        Err(err) if skippable(&err, add.try_set) => return Ok(None),
        Err(err) => return Err(err),
    };
    runt.model.req_form(&add.form)?;
    runt.confirm(&["node", "add", add.form.as_str()])?;
    let mut warns = Vec::new();
    let created = match runt.store.add_node(&add.form, &prim, &mut warns) {
        Ok(created) => created,
        Err(err) if skippable(&err, add.try_set) => return Ok(None),
        Err(err) => return Err(err),
    };
    runt.forward(warns);
    record_profile_timer(StageKind::Edit, timer);
    trace!(node = %created.repr(), "storm.edit.add");
    Ok(Some(created))
}

struct NodeAddProducer {
    add: Arc<NodeAdd>,
    frame: Arc<Frame>,
}

impl Producer for NodeAddProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> std::result::Result<Option<BoxStage>, Flow> {
        Ok(create(&self.add, runt, &self.frame, node)?.map(|created| Seed::new([created])))
    }
}

/// `( form=value edits... )`: the trailing edits only see the created node.
struct ParensProducer {
    parens: Arc<EditParens>,
    frame: Arc<Frame>,
}

impl Producer for ParensProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> std::result::Result<Option<BoxStage>, Flow> {
        let Some(created) = create(&self.parens.add, runt, &self.frame, node)? else {
            return Ok(None);
        };
        Ok(Some(build_edits(
            Seed::new([created]),
            &self.parens.edits,
            &self.frame,
        )))
    }
}

/// Applies one property or tag edit to every inbound node.
struct EditStage {
    upstream: BoxStage,
    edit: Edit,
    frame: Arc<Frame>,
}

impl Stage for EditStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        let Some(node) = self.upstream.try_next(runt)? else {
            return Ok(None);
        };
        runt.check()?;
        let timer = profile_timer();
        let edited = apply(&self.edit, node, runt, &self.frame)?;
        record_profile_timer(StageKind::Edit, timer);
        Ok(Some(edited))
    }
}

fn apply(edit: &Edit, node: Node, runt: &Runt, frame: &Arc<Frame>) -> Result<Node> {
    let cx = Cx::new(runt, frame, Some(&node));
    let store = &runt.store;
    let mut warns = Vec::new();
    let edited = match edit {
        Edit::PropSet(set) => match set_prop(set, &node, &cx, &mut warns)? {
            Some(edited) => edited,
            None => return Ok(node),
        },
        Edit::PropDel(prop) => {
            let name = resolve_name(&prop.name, &cx)?;
            if prop.univ {
                let full = runt.model.req_univ(&name)?.full.clone();
                runt.confirm(&["node", "prop", "del", full.as_str()])?;
                store.del_univ(&node, &name)?
            } else {
                let full = runt.model.req_prop(&node.form, &name)?.full.clone();
                runt.confirm(&["node", "prop", "del", full.as_str()])?;
                store.del_prop(&node, &name)?
            }
        }
        Edit::TagAdd(add) => {
            let tag = applied_tag(&add.tag, &cx)?;
            let ival = match &add.ival {
                Some(expr) => Some(eval(expr, &cx)?.to_prim()?),
                None => None,
            };
            confirm_tag(runt, "add", &tag)?;
            store.add_tag(&node, &tag, ival.as_ref(), &mut warns)?
        }
        Edit::TagDel(tag) => {
            let tag = applied_tag(tag, &cx)?;
            confirm_tag(runt, "del", &tag)?;
            store.del_tag(&node, &tag)?
        }
        Edit::TagPropSet(set) => {
            let tag = applied_tag(&set.tag, &cx)?;
            let valu = eval(&set.value, &cx)?.to_prim()?;
            confirm_tag(runt, "add", &tag)?;
            store.set_tag_prop(&node, &tag, &set.prop, &valu, &mut warns)?
        }
        Edit::TagPropDel(del) => {
            let tag = applied_tag(&del.tag, &cx)?;
            confirm_tag(runt, "del", &tag)?;
            store.del_tag_prop(&node, &tag, &del.prop)?
        }
        Edit::NodeAdd(_) | Edit::Parens(_) => return Ok(node),
    };
    runt.forward(warns);
    Ok(edited)
}

/// Property or universal assignment. `None` means a try-set skipped.
fn set_prop(set: &PropSet, node: &Node, cx: &Cx<'_>, warns: &mut Vec<crate::storage::Deprecation>) -> Result<Option<Node>> {
    let runt = cx.runt;
    let name = resolve_name(&set.prop.name, cx)?;
    let full = if set.prop.univ {
        runt.model.req_univ(&name)?.full.clone()
    } else {
        runt.model.req_prop(&node.form, &name)?.full.clone()
    };
    let valu: Value = eval(&set.value, cx)?;
    let prim: Prim = match valu.to_prim() {
        Ok(prim) => prim,
        Err(err) if skippable(&err, set.try_set) => return Ok(None),
        Err(err) => return Err(err),
    };
    runt.confirm(&["node", "prop", "set", full.as_str()])?;
    let edited = if set.prop.univ {
        runt.store.set_univ(node, &name, &prim, warns)
    } else {
        runt.store.set_prop(node, &name, &prim, warns)
    };
    match edited {
        Ok(edited) => Ok(Some(edited)),
        Err(err) if skippable(&err, set.try_set) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Resolves a tag an edit applies; wildcards are only valid when matching.
fn applied_tag(tag: &TagMatch, cx: &Cx<'_>) -> Result<String> {
    let name = resolve_tag(tag, cx)?;
    if tag.has_glob() {
        return Err(StormError::bad_valu(
            "syn:tag",
            &name,
            "Tag globs may only be used in lifts and filters",
        ));
    }
    Ok(name)
}

fn confirm_tag(runt: &Runt, verb: &str, tag: &str) -> Result<()> {
    let mut perm = vec!["node", "tag", verb];
    perm.extend(tag.split('.'));
    runt.confirm(&perm)
}
