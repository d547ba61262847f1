//! Builtin method tables and dispatch.
//!
//! Tables are built once per process and published through a `OnceLock`, so
//! concurrently starting queries observe the same read-only registry.

use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;

use super::call::Kwargs;
use crate::error::{Result, StormError};
use crate::prim::Prim;
use crate::value::{BoundMethod, Function, Value, ValueKind};

/// Arity contract of one builtin.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MethodInfo {
    pub(crate) name: &'static str,
    pub(crate) min: usize,
    /// `None` accepts any number of positionals.
    pub(crate) max: Option<usize>,
    /// Whether arbitrary keyword arguments are accepted.
    pub(crate) kwargs: bool,
}

const fn info(name: &'static str, min: usize, max: Option<usize>, kwargs: bool) -> MethodInfo {
    MethodInfo {
        name,
        min,
        max,
        kwargs,
    }
}

static REGISTRY: OnceLock<FxHashMap<ValueKind, Vec<MethodInfo>>> = OnceLock::new();

/// Builtins callable on values of `kind`. `ValueKind::Lib` lists `$lib` members.
pub(crate) fn share_info(kind: ValueKind) -> &'static [MethodInfo] {
    let registry = REGISTRY.get_or_init(|| {
        let mut map = FxHashMap::default();
        map.insert(
            ValueKind::Lib,
            vec![
                info("print", 1, Some(1), true),
                info("warn", 1, Some(1), true),
                info("fire", 0, Some(1), true),
                info("dict", 0, Some(0), true),
                info("list", 0, None, false),
                info("set", 0, None, false),
                info("len", 1, Some(1), false),
                info("import", 1, Some(1), false),
                info("stats.tally", 0, Some(0), false),
            ],
        );
        map.insert(
            ValueKind::Node,
            vec![
                info("value", 0, Some(0), false),
                info("form", 0, Some(0), false),
                info("ndef", 0, Some(0), false),
                info("repr", 0, Some(0), false),
                info("tags", 0, Some(0), false),
            ],
        );
        map.insert(
            ValueKind::Dict,
            vec![
                info("keys", 0, Some(0), false),
                info("values", 0, Some(0), false),
                info("get", 1, Some(2), false),
            ],
        );
        map.insert(
            ValueKind::List,
            vec![info("append", 1, Some(1), false), info("size", 0, Some(0), false)],
        );
        map.insert(
            ValueKind::Tally,
            vec![info("inc", 1, Some(2), false), info("get", 1, Some(1), false)],
        );
        map.insert(
            ValueKind::Set,
            vec![
                info("add", 0, None, false),
                info("has", 1, Some(1), false),
                info("rem", 0, None, false),
                info("size", 0, Some(0), false),
            ],
        );
        map
    });
    registry.get(&kind).map_or(&[], Vec::as_slice)
}

pub(crate) fn lookup(kind: ValueKind, name: &str) -> Option<MethodInfo> {
    share_info(kind).iter().find(|info| info.name == name).copied()
}

/// Validates positional and keyword counts against a builtin's contract.
pub(crate) fn check_arity(info: &MethodInfo, label: &str, args: &[Value], kwargs: &Kwargs) -> Result<()> {
    if !info.kwargs && !kwargs.is_empty() {
        let keys: Vec<&str> = kwargs.iter().map(|(key, _)| key.as_str()).collect();
        return Err(StormError::runtime(format!(
            "{label}() got unexpected keyword arguments: {}",
            keys.join(", ")
        ))
        .with("name", label)
        .with("kwargs", keys));
    }
    let got = args.len();
    if got < info.min || info.max.is_some_and(|max| got > max) {
        let expected = info.max.unwrap_or(info.min);
        return Err(StormError::runtime(format!(
            "{label}() takes {expected} arguments but {got} were provided"
        ))
        .with("name", label)
        .with("expected", expected)
        .with("got", got));
    }
    Ok(())
}

/// Binds a method to its receiver, or `None` when the kind has no such method.
pub(crate) fn bind(recv: &Value, name: &str) -> Option<Value> {
    let info = lookup(recv.kind(), name)?;
    Some(Value::Func(Function::Method(Arc::new(BoundMethod {
        recv: recv.clone(),
        name: info.name,
    }))))
}

pub(crate) fn call(recv: &Value, name: &'static str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    let Some(info) = lookup(recv.kind(), name) else {
        return Err(StormError::NoSuchName { name: name.into() });
    };
    check_arity(&info, name, &args, &kwargs)?;
    let mut args = args.into_iter();
    match recv {
        Value::Node(node) => Ok(match name {
            "value" => Value::from_prim(&node.valu),
            "form" => Value::str(node.form.clone()),
            "ndef" => Value::list(vec![Value::str(node.form.clone()), Value::from_prim(&node.valu)]),
            "repr" => Value::str(node.valu.to_string()),
            _ => Value::list(node.tags.keys().map(|tag| Value::str(tag.clone())).collect()),
        }),
        Value::Dict(items) => Ok(match name {
            "keys" => Value::list(items.lock().keys().map(Value::from_prim).collect()),
            "values" => Value::list(items.lock().values().cloned().collect()),
            _ => {
                let key = args.next().unwrap_or(Value::Null).to_prim()?;
                let default = args.next().unwrap_or(Value::Null);
                let hit = items.lock().get(&key).cloned();
                hit.unwrap_or(default)
            }
        }),
        Value::List(items) => match name {
            "append" => {
                let valu = args.next().unwrap_or(Value::Null);
                items.lock().push(valu);
                Ok(Value::Null)
            }
            _ => Ok(Value::Int(len_i64(items.lock().len()))),
        },
        Value::Set(set) => {
            // Arguments may be the receiver itself; convert before locking it.
            let prims = args.map(|valu| valu.to_prim()).collect::<Result<Vec<_>>>()?;
            let mut set = set.lock();
            match name {
                "add" => {
                    for prim in prims {
                        set.add(prim)?;
                    }
                    Ok(Value::Null)
                }
                "has" => {
                    let prim = prims.into_iter().next().unwrap_or(Prim::Null);
                    Ok(Value::Bool(set.contains(&prim)?))
                }
                "rem" => {
                    for prim in &prims {
                        set.discard(prim)?;
                    }
                    Ok(Value::Null)
                }
                _ => Ok(Value::Int(len_i64(set.len()))),
            }
        }
        Value::Tally(counts) => {
            let key = args.next().unwrap_or(Value::Null).repr();
            match name {
                "inc" => {
                    let step = match args.next() {
                        None => 1,
                        Some(Value::Int(step)) => step,
                        Some(other) => {
                            return Err(StormError::bad_valu(
                                "int",
                                &other,
                                "tally increments must be integers",
                            ))
                        }
                    };
                    let mut counts = counts.lock();
                    let slot = counts.entry(key).or_insert(0);
                    *slot = slot.saturating_add(step);
                    Ok(Value::Null)
                }
                _ => Ok(Value::Int(counts.lock().get(&key).copied().unwrap_or(0))),
            }
        }
        _ => Err(StormError::NoSuchName { name: name.into() }),
    }
}

pub(crate) fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}
