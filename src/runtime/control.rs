//! Statement operators: assignment, calls, loops, branches and non-local exits.

use std::collections::VecDeque;
use std::sync::Arc;

use super::call::{call_stream, nodes_of};
use super::eval::{eval, resolve_name, Cx};
use super::runt::Runt;
use super::scope::Frame;
use super::stages::{build_query, BoxStage, Flow, Producer, Pull, Seed, Stage};
use crate::ast::{Expr, ExprKind, ForLoop, IfElse, Return, SetItem, SetVar};
use crate::error::{Result, StormError};
use crate::node::Node;
use crate::prim::Prim;
use crate::value::Value;

type Produced = std::result::Result<Option<BoxStage>, Flow>;

pub(crate) struct SetVarProducer {
    set: Arc<SetVar>,
    frame: Arc<Frame>,
}

impl SetVarProducer {
    pub(crate) fn new(set: Arc<SetVar>, frame: Arc<Frame>) -> Self {
        Self { set, frame }
    }
}

impl Producer for SetVarProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> Produced {
        let cx = Cx::new(runt, &self.frame, node);
        let valu = eval(&self.set.value, &cx)?;
        assign(&self.frame, &self.set.names, valu)?;
        Ok(None)
    }
}

/// Binds one name, or unpacks a list or set across several.
fn assign(frame: &Frame, names: &[String], valu: Value) -> Result<()> {
    if let [name] = names {
        frame.set(name, valu);
        return Ok(());
    }
    let items = unpack(valu, names.len())?;
    for (name, item) in names.iter().zip(items) {
        frame.set(name, item);
    }
    Ok(())
}

fn unpack(valu: Value, want: usize) -> Result<Vec<Value>> {
    let items = match &valu {
        Value::List(items) => items.lock().clone(),
        Value::Set(set) => set.lock().to_vec()?.iter().map(Value::from_prim).collect(),
        other => {
            return Err(StormError::runtime(format!(
                "{} cannot be unpacked",
                other.kind().name()
            ))
            .with("kind", other.kind().name()))
        }
    };
    if items.len() != want {
        return Err(StormError::runtime(format!(
            "Expected {want} values to unpack, got {}",
            items.len()
        ))
        .with("expected", want)
        .with("got", items.len()));
    }
    Ok(items)
}

pub(crate) struct SetItemProducer {
    set: Arc<SetItem>,
    frame: Arc<Frame>,
}

impl SetItemProducer {
    pub(crate) fn new(set: Arc<SetItem>, frame: Arc<Frame>) -> Self {
        Self { set, frame }
    }
}

impl Producer for SetItemProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> Produced {
        let cx = Cx::new(runt, &self.frame, node);
        let base = eval(&self.set.base, &cx)?;
        let key = resolve_name(&self.set.key, &cx)?;
        let valu = eval(&self.set.value, &cx)?;
        set_item(&base, &key, valu)?;
        Ok(None)
    }
}

fn set_item(base: &Value, key: &str, valu: Value) -> Result<()> {
    match base {
        Value::Dict(items) => {
            items.lock().insert(Prim::Str(key.to_owned()), valu);
            Ok(())
        }
        Value::List(items) => {
            let mut items = items.lock();
            let size = items.len();
            let slot = key
                .parse::<i64>()
                .ok()
                .and_then(|idx| if idx < 0 { idx.checked_add(size as i64) } else { Some(idx) })
                .and_then(|idx| usize::try_from(idx).ok())
                .and_then(|idx| items.get_mut(idx));
            match slot {
                Some(slot) => {
                    *slot = valu;
                    Ok(())
                }
                None => Err(StormError::runtime(format!("List index {key} is out of range"))
                    .with("index", key)
                    .with("size", size)),
            }
        }
        other => Err(StormError::runtime(format!(
            "{} does not support assignment.",
            other.kind().name()
        ))
        .with("kind", other.kind().name())),
    }
}

/// Expression statement, evaluated for its side effects.
pub(crate) struct ExprProducer {
    expr: Arc<Expr>,
    frame: Arc<Frame>,
}

impl ExprProducer {
    pub(crate) fn new(expr: Arc<Expr>, frame: Arc<Frame>) -> Self {
        Self { expr, frame }
    }
}

impl Producer for ExprProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> Produced {
        let cx = Cx::new(runt, &self.frame, node);
        eval(&self.expr, &cx)?;
        Ok(None)
    }
}

pub(crate) struct ForProducer {
    each: Arc<ForLoop>,
    frame: Arc<Frame>,
}

impl ForProducer {
    pub(crate) fn new(each: Arc<ForLoop>, frame: Arc<Frame>) -> Self {
        Self { each, frame }
    }
}

impl Producer for ForProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> Produced {
        let cx = Cx::new(runt, &self.frame, node);
        let items = iter_items(eval(&self.each.iter, &cx)?)?;
        Ok(Some(Box::new(ForStage {
            each: Arc::clone(&self.each),
            frame: Arc::clone(&self.frame),
            node: node.cloned(),
            items: items.into(),
            body: None,
            count: 0,
        })))
    }
}

/// Snapshot of the items a loop walks. Dicts iterate as `(key, value)` pairs.
fn iter_items(valu: Value) -> Result<Vec<Value>> {
    Ok(match &valu {
        Value::Null => Vec::new(),
        Value::List(items) => items.lock().clone(),
        Value::Set(set) => set.lock().to_vec()?.iter().map(Value::from_prim).collect(),
        Value::Dict(items) => items
            .lock()
            .iter()
            .map(|(key, valu)| Value::list(vec![Value::from_prim(key), valu.clone()]))
            .collect(),
        Value::Tally(counts) => counts
            .lock()
            .iter()
            .map(|(name, count)| Value::list(vec![Value::str(name.clone()), Value::Int(*count)]))
            .collect(),
        other => {
            return Err(StormError::runtime(format!(
                "{} is not iterable",
                other.kind().name()
            ))
            .with("kind", other.kind().name()))
        }
    })
}

/// Runs the loop body once per item in the enclosing frame.
struct ForStage {
    each: Arc<ForLoop>,
    frame: Arc<Frame>,
    node: Option<Node>,
    items: VecDeque<Value>,
    body: Option<BoxStage>,
    count: usize,
}

impl Stage for ForStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        loop {
            if let Some(body) = self.body.as_mut() {
                match body.try_next(runt) {
                    Ok(Some(node)) => return Ok(Some(node)),
                    Ok(None) | Err(Flow::Continue) => self.body = None,
                    Err(Flow::Break) => {
                        self.body = None;
                        self.items.clear();
                        return Ok(None);
                    }
                    Err(flow) => return Err(flow),
                }
            }
            let Some(item) = self.items.pop_front() else {
                return Ok(None);
            };
            runt.check()?;
            self.count += 1;
            if let Some(max) = runt.opts.max_loop_items {
                if self.count > max {
                    return Err(StormError::runtime(format!(
                        "Loop exceeded the maximum of {max} items"
                    ))
                    .with("max", max)
                    .into());
                }
            }
            assign(&self.frame, &self.each.vars, item)?;
            let seed = Seed::new(self.node.clone());
            self.body = Some(build_query(&self.each.body, &self.frame, seed, runt));
        }
    }
}

pub(crate) struct IfProducer {
    branch: Arc<IfElse>,
    frame: Arc<Frame>,
}

impl IfProducer {
    pub(crate) fn new(branch: Arc<IfElse>, frame: Arc<Frame>) -> Self {
        Self { branch, frame }
    }
}

impl Producer for IfProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> Produced {
        let cx = Cx::new(runt, &self.frame, node);
        let seed = Seed::new(node.cloned());
        for (cond, body) in &self.branch.clauses {
            if eval(cond, &cx)?.truthy() {
                return Ok(Some(build_query(body, &self.frame, seed, runt)));
            }
        }
        match &self.branch.default {
            Some(body) => Ok(Some(build_query(body, &self.frame, seed, runt))),
            None => Ok(Some(seed)),
        }
    }
}

pub(crate) struct ReturnProducer {
    ret: Arc<Return>,
    frame: Arc<Frame>,
}

impl ReturnProducer {
    pub(crate) fn new(ret: Arc<Return>, frame: Arc<Frame>) -> Self {
        Self { ret, frame }
    }
}

impl Producer for ReturnProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> Produced {
        let valu = match &self.ret.value {
            Some(expr) => eval(expr, &Cx::new(runt, &self.frame, node))?,
            None => Value::Null,
        };
        Err(Flow::Return(valu))
    }
}

pub(crate) enum BreakProducer {
    Break,
    Continue,
}

impl Producer for BreakProducer {
    fn produce(&mut self, _runt: &Runt, _node: Option<&Node>) -> Produced {
        Err(match self {
            BreakProducer::Break => Flow::Break,
            BreakProducer::Continue => Flow::Continue,
        })
    }
}

/// `yield` statement: nodes from a call or node-valued expression join the
/// pipeline after the inbound node.
pub(crate) struct YieldProducer {
    expr: Arc<Expr>,
    frame: Arc<Frame>,
}

impl YieldProducer {
    pub(crate) fn new(expr: Arc<Expr>, frame: Arc<Frame>) -> Self {
        Self { expr, frame }
    }
}

impl Producer for YieldProducer {
    fn produce(&mut self, runt: &Runt, node: Option<&Node>) -> Produced {
        let cx = Cx::new(runt, &self.frame, node);
        let stage = match &self.expr.kind {
            ExprKind::Call { func, args, kwargs } => {
                let callee = eval(func, &cx)?;
                let args = args.iter().map(|arg| eval(arg, &cx)).collect::<Result<Vec<_>>>()?;
                let kwargs = kwargs
                    .iter()
                    .map(|(key, valu)| Ok((key.clone(), eval(valu, &cx)?)))
                    .collect::<Result<Vec<_>>>()?;
                call_stream(callee, args, kwargs, &cx)?
            }
            _ => nodes_of(eval(&self.expr, &cx)?)?,
        };
        Ok(Some(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacking_checks_length() {
        let frame = Frame::root();
        let names = vec!["a".to_owned(), "b".to_owned()];
        let pair = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert!(assign(&frame, &names, pair).is_ok());
        assert_eq!(frame.get("b"), Some(Value::Int(2)));

        let err = assign(&frame, &names, Value::list(vec![Value::Int(1)])).expect_err("short");
        assert_eq!(err.info().get("expected"), Some(&serde_json::json!(2)));
        assert_eq!(err.info().get("got"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn item_assignment_by_kind() -> Result<()> {
        let dict = Value::dict(Default::default());
        set_item(&dict, "hehe", Value::Int(1))?;
        let Value::Dict(items) = &dict else {
            panic!("dict literal");
        };
        assert_eq!(items.lock().get(&Prim::from("hehe")), Some(&Value::Int(1)));

        let list = Value::list(vec![Value::Int(0), Value::Int(1)]);
        set_item(&list, "-1", Value::Int(9))?;
        assert_eq!(list, Value::list(vec![Value::Int(0), Value::Int(9)]));
        assert!(set_item(&list, "5", Value::Null).is_err());

        let err = set_item(&Value::Int(3), "x", Value::Null).expect_err("ints are immutable");
        assert_eq!(err.mesg(), "Int does not support assignment.");
        Ok(())
    }

    #[test]
    fn dicts_iterate_as_pairs() -> Result<()> {
        let mut map = crate::value::DictMap::new();
        map.insert(Prim::from("k"), Value::Int(1));
        let items = iter_items(Value::dict(map))?;
        assert_eq!(items, vec![Value::list(vec![Value::from("k"), Value::Int(1)])]);
        assert!(iter_items(Value::Null)?.is_empty());
        assert!(iter_items(Value::Int(1)).is_err());
        Ok(())
    }
}
