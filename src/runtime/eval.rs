//! Expression and filter condition evaluation.

use std::sync::Arc;

use super::call::call_value;
use super::library;
use super::methods;
use super::runt::Runt;
use super::scope::Frame;
use crate::ast::{BinOp, Cmp, Cond, Expr, ExprKind, Name, PropRef, TagMatch, TagPart};
use crate::error::{Result, StormError};
use crate::model::PropTarget;
use crate::node::Node;
use crate::prim::Prim;
use crate::storage::tag_glob_matches;
use crate::value::{DictMap, Library, Value};

/// Evaluation context: the query runtime, the active frame and the bound node.
#[derive(Clone, Copy)]
pub(crate) struct Cx<'a> {
    pub(crate) runt: &'a Runt,
    pub(crate) frame: &'a Arc<Frame>,
    pub(crate) node: Option<&'a Node>,
}

impl<'a> Cx<'a> {
    pub(crate) fn new(runt: &'a Runt, frame: &'a Arc<Frame>, node: Option<&'a Node>) -> Self {
        Self { runt, frame, node }
    }

    fn node(&self) -> Result<&'a Node> {
        self.node.ok_or_else(|| StormError::NoSuchVar {
            name: "node".into(),
        })
    }
}

pub(crate) fn eval(expr: &Expr, cx: &Cx<'_>) -> Result<Value> {
    match &expr.kind {
        ExprKind::Const(prim) => Ok(Value::from_prim(prim)),
        ExprKind::List(items) => Ok(Value::list(
            items.iter().map(|item| eval(item, cx)).collect::<Result<_>>()?,
        )),
        ExprKind::Dict(items) => {
            let mut map = DictMap::new();
            for (key, valu) in items {
                map.insert(eval(key, cx)?.to_prim()?, eval(valu, cx)?);
            }
            Ok(Value::dict(map))
        }
        ExprKind::Var(name) => cx
            .frame
            .get(name)
            .ok_or_else(|| StormError::NoSuchVar { name: name.clone() }),
        ExprKind::Node => Ok(Value::Node(Arc::new(cx.node()?.clone()))),
        ExprKind::RelProp(name) => {
            let node = cx.node()?;
            let name = resolve_name(name, cx)?;
            cx.runt.model.req_prop(&node.form, &name)?;
            Ok(node.props.get(&name).map_or(Value::Null, Value::from_prim))
        }
        ExprKind::UnivProp(name) => {
            let node = cx.node()?;
            let name = resolve_name(name, cx)?;
            cx.runt.model.req_univ(&name)?;
            Ok(node.univs.get(&name).map_or(Value::Null, Value::from_prim))
        }
        ExprKind::TagValue(tag) => {
            let node = cx.node()?;
            let tag = resolve_tag(tag, cx)?;
            Ok(match node.tags.get(&tag) {
                Some(Some((lo, hi))) => Value::list(vec![Value::Int(*lo), Value::Int(*hi)]),
                _ => Value::Null,
            })
        }
        ExprKind::Deref { base, key } => {
            let base = eval(base, cx)?;
            deref(base, key, cx)
        }
        ExprKind::Call { func, args, kwargs } => {
            let callee = eval(func, cx)?;
            let args = args.iter().map(|arg| eval(arg, cx)).collect::<Result<Vec<_>>>()?;
            let kwargs = kwargs
                .iter()
                .map(|(key, valu)| Ok((key.clone(), eval(valu, cx)?)))
                .collect::<Result<Vec<_>>>()?;
            call_value(callee, args, kwargs, cx)
        }
        ExprKind::Binary { op, lhs, rhs } => match op {
            BinOp::And => {
                let lhs = eval(lhs, cx)?;
                if !lhs.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(eval(rhs, cx)?.truthy()))
            }
            BinOp::Or => {
                let lhs = eval(lhs, cx)?;
                if lhs.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(eval(rhs, cx)?.truthy()))
            }
            _ => binary(*op, eval(lhs, cx)?, eval(rhs, cx)?),
        },
        ExprKind::Not(inner) => Ok(Value::Bool(!eval(inner, cx)?.truthy())),
    }
}

fn deref(base: Value, key: &Name, cx: &Cx<'_>) -> Result<Value> {
    let name = resolve_name(key, cx)?;
    match &base {
        Value::Lib(Library::Root) => library::member(&name),
        Value::Lib(Library::Stats) => library::stats_member(&name),
        Value::Lib(Library::Module(module)) => {
            module.frame.get(&name).ok_or_else(|| StormError::NoSuchName {
                name: format!("{}.{name}", module.name),
            })
        }
        Value::Dict(items) => {
            let hit = items.lock().get(&Prim::Str(name.clone())).cloned();
            match hit {
                Some(valu) => Ok(valu),
                None => methods::bind(&base, &name).ok_or_else(|| StormError::BadPropValu {
                    name: name.clone(),
                    mesg: format!("No key named {name} in the dictionary"),
                }),
            }
        }
        _ => methods::bind(&base, &name).ok_or_else(|| StormError::BadPropValu {
            name: name.clone(),
            mesg: format!("{} has no member named {name}", base.kind().name()),
        }),
    }
}

/// Resolves a static or variable-provided identifier.
pub(crate) fn resolve_name(name: &Name, cx: &Cx<'_>) -> Result<String> {
    match name {
        Name::Static(text) => Ok(text.clone()),
        Name::Dynamic(expr) => Ok(eval(expr, cx)?.repr()),
    }
}

/// Resolves a tag reference into its dotted, lowercased text. Wildcards stay `*`.
pub(crate) fn resolve_tag(tag: &TagMatch, cx: &Cx<'_>) -> Result<String> {
    let mut parts = Vec::with_capacity(tag.parts.len());
    for part in &tag.parts {
        parts.push(match part {
            TagPart::Static(seg) => seg.clone(),
            TagPart::Dynamic(expr) => eval(expr, cx)?.repr(),
            TagPart::Glob => "*".to_owned(),
        });
    }
    Ok(parts.join(".").to_lowercase())
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
    use std::cmp::Ordering;
    let mismatch = |op: &str, lhs: &Value, rhs: &Value| {
        StormError::runtime(format!(
            "Unsupported operand types for {op}: {} and {}",
            lhs.kind().name(),
            rhs.kind().name()
        ))
        .with("op", op)
    };
    match op {
        BinOp::Eq => return Ok(Value::Bool(lhs == rhs)),
        BinOp::Ne => return Ok(Value::Bool(lhs != rhs)),
        _ => {}
    }
    if matches!(op, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge) {
        let order = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                as_float(&lhs).total_cmp(&as_float(&rhs))
            }
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => return Err(mismatch("comparison", &lhs, &rhs)),
        };
        let hit = match op {
            BinOp::Lt => order == Ordering::Less,
            BinOp::Le => order != Ordering::Greater,
            BinOp::Gt => order == Ordering::Greater,
            _ => order != Ordering::Less,
        };
        return Ok(Value::Bool(hit));
    }
    match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let out = match op {
                BinOp::Add => a.checked_add(*b),
                BinOp::Sub => a.checked_sub(*b),
                BinOp::Mul => a.checked_mul(*b),
                _ => {
                    if *b == 0 {
                        return Err(StormError::runtime("Division by zero"));
                    }
                    a.checked_div(*b)
                }
            };
            out.map(Value::Int)
                .ok_or_else(|| StormError::runtime("Integer overflow"))
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (a, b) = (as_float(&lhs), as_float(&rhs));
            Ok(Value::Float(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                _ => a / b,
            }))
        }
        (Value::Str(a), Value::Str(b)) if op == BinOp::Add => Ok(Value::Str(format!("{a}{b}"))),
        _ => Err(mismatch("arithmetic", &lhs, &rhs)),
    }
}

fn as_float(valu: &Value) -> f64 {
    match valu {
        Value::Int(v) => *v as f64,
        Value::Float(v) => *v,
        _ => f64::NAN,
    }
}

/// Evaluates a filter condition against the bound node.
pub(crate) fn eval_cond(cond: &Cond, cx: &Cx<'_>) -> Result<bool> {
    let model = &cx.runt.model;
    match cond {
        Cond::Form(form) => {
            model.req_form(form)?;
            Ok(cx.node()?.form == *form)
        }
        Cond::AbsProp { prop, cmp } => {
            let node = cx.node()?;
            let (ty, have) = match model.resolve(prop)? {
                PropTarget::Primary(form) => {
                    if node.form != form.name {
                        return Ok(false);
                    }
                    (form.name.clone(), Some(&node.valu))
                }
                PropTarget::Prop(form, def) => {
                    if node.form != form.name {
                        return Ok(false);
                    }
                    (def.ty.clone(), node.props.get(&def.name))
                }
                PropTarget::Univ(form, def) => {
                    if form.is_some_and(|form| form.name != node.form) {
                        return Ok(false);
                    }
                    (def.ty.clone(), node.univs.get(&def.name))
                }
            };
            compare(&ty, have, cmp.as_ref(), cx)
        }
        Cond::Prop { prop, cmp } => {
            let node = cx.node()?;
            let (ty, have) = prop_value(prop, node, cx)?;
            compare(&ty, have, cmp.as_ref(), cx)
        }
        Cond::Array { prop, cmp } => {
            let node = cx.node()?;
            let (ty, have) = prop_value(prop, node, cx)?;
            let Some(elem) = model.array_elem(&ty) else {
                return Err(StormError::BadCmprType {
                    name: ty,
                    cmpr: cmp.cmpr.clone(),
                    mesg: "Array filter syntax is only valid on array types".into(),
                });
            };
            let want = eval(&cmp.value, cx)?.to_prim()?;
            let matcher = model.matcher(elem, &cmp.cmpr, &want)?;
            Ok(have
                .and_then(Prim::as_list)
                .is_some_and(|items| items.iter().any(|item| matcher.matches(item))))
        }
        Cond::Tag { tag, cmp } => {
            let node = cx.node()?;
            let pattern = resolve_tag(tag, cx)?;
            let matcher = match cmp {
                Some(cmp) => {
                    let want = eval(&cmp.value, cx)?.to_prim()?;
                    Some(model.matcher("ival", &cmp.cmpr, &want)?)
                }
                None => None,
            };
            let glob = pattern.contains('*');
            Ok(node.tags.iter().any(|(name, ival)| {
                let named = if glob {
                    tag_glob_matches(&pattern, name)
                } else {
                    *name == pattern
                };
                named
                    && match &matcher {
                        None => true,
                        Some(matcher) => ival.is_some_and(|(lo, hi)| {
                            matcher.matches(&Prim::List(vec![Prim::Int(lo), Prim::Int(hi)]))
                        }),
                    }
            }))
        }
        Cond::Expr(expr) => Ok(eval(expr, cx)?.truthy()),
        Cond::Not(inner) => Ok(!eval_cond(inner, cx)?),
        Cond::And(conds) => {
            for cond in conds {
                if !eval_cond(cond, cx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Cond::Or(conds) => {
            for cond in conds {
                if eval_cond(cond, cx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Property type and current value for a relative property reference.
fn prop_value<'n>(prop: &PropRef, node: &'n Node, cx: &Cx<'_>) -> Result<(String, Option<&'n Prim>)> {
    let name = resolve_name(&prop.name, cx)?;
    if prop.univ {
        let def = cx.runt.model.req_univ(&name)?;
        return Ok((def.ty.clone(), node.univs.get(&name)));
    }
    let def = cx.runt.model.req_prop(&node.form, &name)?;
    Ok((def.ty.clone(), node.props.get(&name)))
}

/// The matcher is built before the value is inspected, so a malformed
/// comparison fails on every node rather than only on nodes holding the prop.
fn compare(ty: &str, have: Option<&Prim>, cmp: Option<&Cmp>, cx: &Cx<'_>) -> Result<bool> {
    let matcher = match cmp {
        Some(cmp) => {
            let want = eval(&cmp.value, cx)?.to_prim()?;
            Some(cx.runt.model.matcher(ty, &cmp.cmpr, &want)?)
        }
        None => None,
    };
    let Some(have) = have else {
        return Ok(false);
    };
    Ok(matcher.map_or(true, |matcher| matcher.matches(have)))
}

