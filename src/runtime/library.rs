//! `$lib` members.

use std::sync::Arc;

use tracing::debug;

use super::call::Kwargs;
use super::eval::Cx;
use super::methods::{self, len_i64};
use super::scope::Frame;
use super::stages::{build_query, run_for_value, Seed};
use super::Event;
use crate::analyze;
use crate::error::{Info, Result, StormError};
use crate::prim::Prim;
use crate::spooled::SpooledSet;
use crate::value::{DictMap, Function, Library, Module, Tally, Value, ValueKind};

/// Resolves `$lib.<name>`.
pub(crate) fn member(name: &str) -> Result<Value> {
    if name == "stats" {
        return Ok(Value::Lib(Library::Stats));
    }
    match methods::lookup(ValueKind::Lib, name) {
        Some(info) if !info.name.contains('.') => Ok(Value::Func(Function::Lib(info.name))),
        _ => Err(StormError::NoSuchName {
            name: format!("$lib.{name}"),
        }),
    }
}

/// Resolves `$lib.stats.<name>`.
pub(crate) fn stats_member(name: &str) -> Result<Value> {
    match methods::lookup(ValueKind::Lib, &format!("stats.{name}")) {
        Some(info) => Ok(Value::Func(Function::Lib(info.name))),
        None => Err(StormError::NoSuchName {
            name: format!("$lib.stats.{name}"),
        }),
    }
}

pub(crate) fn call(name: &'static str, args: Vec<Value>, kwargs: Kwargs, cx: &Cx<'_>) -> Result<Value> {
    let Some(info) = methods::lookup(ValueKind::Lib, name) else {
        return Err(StormError::NoSuchName {
            name: format!("$lib.{name}"),
        });
    };
    check(&info, name, &args, &kwargs)?;
    let runt = cx.runt;
    match name {
        "print" => {
            let mesg = format_mesg(&args[0], &kwargs);
            runt.emit(Event::Print { mesg });
            Ok(Value::Null)
        }
        "warn" => {
            let mesg = format_mesg(&args[0], &kwargs);
            let info = kwargs_info(&kwargs)?;
            runt.emit(Event::Warn { mesg, info });
            Ok(Value::Null)
        }
        "fire" => {
            let (name, kwargs) = fire_name(args, kwargs)?;
            let data = kwargs_info(&kwargs)?;
            runt.emit(Event::Fire { name, data });
            Ok(Value::Null)
        }
        "dict" => {
            let map: DictMap = kwargs
                .into_iter()
                .map(|(key, valu)| (Prim::Str(key), valu))
                .collect();
            Ok(Value::dict(map))
        }
        "list" => Ok(Value::list(args)),
        "set" => {
            let mut set = SpooledSet::with_options(&runt.opts);
            for valu in &args {
                set.add(valu.to_prim()?)?;
            }
            Ok(Value::Set(Arc::new(parking_lot::Mutex::new(set))))
        }
        "len" => length(&args[0]),
        "stats.tally" => Ok(Value::Tally(Arc::new(parking_lot::Mutex::new(Tally::new())))),
        "import" => import(&args[0].repr(), cx),
        _ => Err(StormError::NoSuchName {
            name: format!("$lib.{name}"),
        }),
    }
}

/// The event name is the one positional argument, or the `name` keyword.
fn fire_name(args: Vec<Value>, mut kwargs: Kwargs) -> Result<(String, Kwargs)> {
    if let Some(name) = args.first() {
        return Ok((name.repr(), kwargs));
    }
    match kwargs.iter().position(|(key, _)| key == "name") {
        Some(idx) => {
            let (_, name) = kwargs.remove(idx);
            Ok((name.repr(), kwargs))
        }
        None => Err(StormError::runtime("$lib.fire() takes 1 arguments but 0 were provided")
            .with("name", "$lib.fire")
            .with("expected", 1)
            .with("got", 0)),
    }
}

fn check(info: &methods::MethodInfo, name: &str, args: &[Value], kwargs: &Kwargs) -> Result<()> {
    methods::check_arity(info, &format!("$lib.{name}"), args, kwargs)
}

/// Substitutes `{key}` placeholders with the repr of the matching keyword.
fn format_mesg(mesg: &Value, kwargs: &Kwargs) -> String {
    let mut text = mesg.repr();
    for (key, valu) in kwargs {
        text = text.replace(&format!("{{{key}}}"), &valu.repr());
    }
    text
}

fn kwargs_info(kwargs: &Kwargs) -> Result<Info> {
    let mut info = Info::new();
    for (key, valu) in kwargs {
        info.insert(key.clone(), valu.to_json()?);
    }
    Ok(info)
}

fn length(valu: &Value) -> Result<Value> {
    let len = match valu {
        Value::Str(text) => text.chars().count(),
        Value::Bytes(bytes) => bytes.len(),
        Value::List(items) => items.lock().len(),
        Value::Dict(items) => items.lock().len(),
        Value::Set(set) => set.lock().len(),
        Value::Tally(counts) => counts.lock().len(),
        other => {
            return Err(StormError::runtime(format!(
                "{} has no length",
                other.kind().name()
            ))
            .with("kind", other.kind().name()))
        }
    };
    Ok(Value::Int(len_i64(len)))
}

/// Runs a registered module's top level in a fresh root frame and returns a
/// handle exposing its variables and functions.
fn import(name: &str, cx: &Cx<'_>) -> Result<Value> {
    let runt = cx.runt;
    let Some(query) = runt.module(name) else {
        return Err(StormError::NoSuchName { name: name.into() });
    };
    analyze::analyze(&query)?;
    let _depth = runt.enter_call(name)?;
    let frame = Frame::root();
    runt.capture(&frame);
    let mut stage = build_query(&query, &frame, Seed::empty(), runt);
    run_for_value(&mut stage, runt)?;
    debug!(module = name, "storm.lib.import");
    Ok(Value::Lib(Library::Module(Arc::new(Module {
        name: name.to_owned(),
        frame,
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholders_take_keyword_reprs() {
        let kwargs = vec![
            ("retn".to_owned(), Value::Int(1)),
            ("who".to_owned(), Value::from("visi")),
        ];
        let text = format_mesg(&Value::from("retn is: {retn} for {who} {missing}"), &kwargs);
        assert_eq!(text, "retn is: 1 for visi {missing}");
    }

    #[test]
    fn unknown_members_are_named() {
        let err = member("newp").err().map(|err| err.info());
        assert_eq!(
            err.and_then(|info| info.get("name").cloned()),
            Some(json!("$lib.newp"))
        );
        assert!(member("print").is_ok());
        assert!(member("stats.tally").is_err());
        assert!(stats_member("tally").is_ok());
        let err = stats_member("newp").err().map(|err| err.info());
        assert_eq!(
            err.and_then(|info| info.get("name").cloned()),
            Some(json!("$lib.stats.newp"))
        );
    }

    #[test]
    fn fire_takes_its_name_from_either_place() -> Result<()> {
        let (name, rest) = fire_name(vec![Value::from("done")], vec![("n".into(), Value::Int(1))])?;
        assert_eq!(name, "done");
        assert_eq!(rest.len(), 1);
        let (name, rest) = fire_name(
            Vec::new(),
            vec![("name".into(), Value::from("node")), ("total".into(), Value::Int(3))],
        )?;
        assert_eq!(name, "node");
        assert_eq!(rest, vec![("total".to_owned(), Value::Int(3))]);
        let err = fire_name(Vec::new(), Vec::new()).expect_err("no name");
        assert_eq!(err.info().get("expected"), Some(&json!(1)));
        Ok(())
    }

    #[test]
    fn lengths_by_kind() -> Result<()> {
        assert_eq!(length(&Value::from("héllo"))?, Value::Int(5));
        assert_eq!(length(&Value::list(vec![Value::Null]))?, Value::Int(1));
        assert_eq!(length(&Value::Int(3)).err().map(|err| err.code()), Some("StormRuntimeError"));
        Ok(())
    }
}
