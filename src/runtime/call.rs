//! Function invocation: argument binding and closure execution.

use std::sync::Arc;

use serde_json::{json, Value as Json};
use tracing::trace;

use super::eval::Cx;
use super::library;
use super::methods;
use super::runt::Runt;
use super::scope::{Frame, ScopeGuard};
use super::stages::{build_query, run_for_value, BoxStage, Flow, Pull, Seed, Stage};
use crate::error::{Result, StormError};
use crate::node::Node;
use crate::profile::{profile_timer, record_profile_timer, StageKind};
use crate::value::{Closure, Function, Value};

/// Positional and keyword arguments after evaluation.
pub(crate) type Kwargs = Vec<(String, Value)>;

/// Binds call arguments to declared parameters.
///
/// Positionals fill parameters left to right. A keyword naming a parameter that
/// a positional already filled is a duplicate; a keyword naming no parameter is
/// unused. Any parameter left unbound afterwards is missing.
pub(crate) fn bind_args(
    name: &str,
    params: &[String],
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Vec<(String, Value)>> {
    if args.len() > params.len() {
        let surplus = &args[params.len()];
        let valu = surplus
            .to_json()
            .unwrap_or_else(|_| Json::String(surplus.repr()));
        return Err(StormError::runtime(format!(
            "{name}() takes {} positional arguments but {} were given",
            params.len(),
            args.len()
        ))
        .with("name", name)
        .with("valu", valu));
    }

    let positional = args.len();
    let mut bound: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    bound.resize(params.len(), None);

    let mut dups = Vec::new();
    let mut unused = Vec::new();
    let mut matched = 0usize;
    for (key, valu) in kwargs {
        match params.iter().position(|param| *param == key) {
            Some(idx) if idx < positional => dups.push(key),
            Some(idx) => {
                if bound[idx].is_none() {
                    matched += 1;
                }
                bound[idx] = Some(valu);
            }
            None => unused.push(key),
        }
    }
    if !dups.is_empty() {
        return Err(StormError::runtime(format!(
            "{name}() got multiple values for parameters: {}",
            dups.join(", ")
        ))
        .with("name", name)
        .with("kwargs", json!(dups)));
    }
    if !unused.is_empty() {
        return Err(StormError::runtime(format!(
            "{name}() got unexpected keyword arguments: {}",
            unused.join(", ")
        ))
        .with("name", name)
        .with("kwargs", json!(unused)));
    }
    if bound.iter().any(Option::is_none) {
        let got = positional + matched;
        return Err(StormError::runtime(format!(
            "{name}() takes {} arguments but {got} were provided",
            params.len()
        ))
        .with("name", name)
        .with("expected", params.len())
        .with("got", got));
    }
    Ok(params
        .iter()
        .cloned()
        .zip(bound.into_iter().flatten())
        .collect())
}

/// Calls any callable value in value context.
pub(crate) fn call_value(callee: Value, args: Vec<Value>, kwargs: Kwargs, cx: &Cx<'_>) -> Result<Value> {
    match callee {
        Value::Func(Function::Closure(closure)) => call_closure(&closure, args, kwargs, cx.runt),
        Value::Func(Function::Lib(name)) => library::call(name, args, kwargs, cx),
        Value::Func(Function::Method(method)) => {
            methods::call(&method.recv, method.name, args, kwargs)
        }
        other => Err(StormError::runtime(format!(
            "{} is not callable",
            other.kind().name()
        ))
        .with("kind", other.kind().name())),
    }
}

/// Runs a closure body to completion and returns its `return` value.
pub(crate) fn call_closure(closure: &Closure, args: Vec<Value>, kwargs: Kwargs, runt: &Runt) -> Result<Value> {
    let _depth = runt.enter_call(closure.name())?;
    let timer = profile_timer();
    let (frame, guard) = call_frame(closure, args, kwargs)?;
    trace!(name = closure.name(), "storm.call.enter");
    let mut stage = build_query(&closure.def.body, &frame, Seed::empty(), runt);
    let retn = run_for_value(&mut stage, runt);
    drop(stage);
    drop(guard);
    record_profile_timer(StageKind::Call, timer);
    retn
}

fn call_frame(closure: &Closure, args: Vec<Value>, kwargs: Kwargs) -> Result<(Arc<Frame>, ScopeGuard)> {
    let bound = bind_args(closure.name(), &closure.def.params, args, kwargs)?;
    let frame = Frame::call(&closure.frame);
    for (name, valu) in bound {
        frame.define(&name, valu);
    }
    let guard = ScopeGuard::new(Arc::clone(&frame));
    Ok((frame, guard))
}

/// Calls a value in `yield` context: closures stream the nodes their body
/// emits; other callables contribute the nodes held by their return value.
pub(crate) fn call_stream(callee: Value, args: Vec<Value>, kwargs: Kwargs, cx: &Cx<'_>) -> Result<BoxStage> {
    if let Value::Func(Function::Closure(closure)) = &callee {
        // Only checked on entry: the body keeps streaming after this returns.
        drop(cx.runt.enter_call(closure.name())?);
        let (frame, guard) = call_frame(closure, args, kwargs)?;
        let body = build_query(&closure.def.body, &frame, Seed::empty(), cx.runt);
        return Ok(Box::new(ClosureStream {
            body: Some(body),
            _guard: guard,
        }));
    }
    let valu = call_value(callee, args, kwargs, cx)?;
    nodes_of(valu)
}

/// Nodes carried by a value yielded into the pipeline.
pub(crate) fn nodes_of(valu: Value) -> Result<BoxStage> {
    let nodes: Vec<Node> = match valu {
        Value::Null => Vec::new(),
        Value::Node(node) => vec![Arc::unwrap_or_clone(node)],
        Value::List(items) => {
            let items = items.lock();
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                match item {
                    Value::Node(node) => out.push(node.as_ref().clone()),
                    other => return Err(not_a_node(other)),
                }
            }
            out
        }
        other => return Err(not_a_node(&other)),
    };
    Ok(Seed::new(nodes))
}

fn not_a_node(valu: &Value) -> StormError {
    StormError::bad_valu(
        "node",
        valu,
        format!("Cannot yield a {} value into the pipeline", valu.kind().name()),
    )
}

/// Closure body streaming its nodes; `return` or `break` ends the stream.
struct ClosureStream {
    body: Option<BoxStage>,
    _guard: ScopeGuard,
}

impl Stage for ClosureStream {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };
        match body.try_next(runt) {
            Ok(Some(node)) => Ok(Some(node)),
            Ok(None) | Err(Flow::Return(_)) | Err(Flow::Break) | Err(Flow::Continue) => {
                self.body = None;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
