mod common;

use serde_json::json;
use storm::ast::*;
use storm::{QueryOpts, Result, Runtime, RuntimeOptions};

fn print(expr: Expr) -> Expr {
    call(lib("print"), vec![expr])
}

/// `function pprint(arg1, arg2, arg3) { print("{a}{b}{c}", ...) }` followed by one call.
fn pprint_call(args: Vec<Expr>, kwargs: Vec<(&str, Expr)>) -> Result<Query> {
    QueryBuilder::new()
        .function("pprint", &["arg1", "arg2", "arg3"], |q| {
            q.call(call_kw(
                lib("print"),
                vec![lit("{a}{b}{c}")],
                vec![("a", var("arg1")), ("b", var("arg2")), ("c", var("arg3"))],
            ))
        })
        .call(call_kw(var("pprint"), args, kwargs))
        .build()
}

#[test]
fn keyword_arguments_bind_by_name() -> Result<()> {
    let rt = common::runtime()?;
    let query = pprint_call(vec![lit(1i64)], vec![("arg3", lit(3i64)), ("arg2", lit(2i64))])?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["123"]);
    Ok(())
}

#[test]
fn argument_binding_errors() -> Result<()> {
    let rt = common::runtime()?;

    let events = rt.events(pprint_call(vec![lit(1i64), lit(2i64)], Vec::new())?, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("missing argument");
    assert_eq!(kind, "StormRuntimeError");
    assert_eq!(info.get("name"), Some(&json!("pprint")));
    assert_eq!(info.get("expected"), Some(&json!(3)));
    assert_eq!(info.get("got"), Some(&json!(2)));

    let query = pprint_call(
        vec![lit(1i64), lit(2i64), lit(3i64)],
        vec![("arg4", lit(4i64))],
    )?;
    let events = rt.events(query, QueryOpts::default());
    let (_, info) = common::error(&events).expect("unused keyword");
    assert_eq!(info.get("kwargs"), Some(&json!(["arg4"])));

    let query = pprint_call(
        vec![lit(1i64), lit(2i64), lit(3i64)],
        vec![("arg1", lit(1i64))],
    )?;
    let events = rt.events(query, QueryOpts::default());
    let (_, info) = common::error(&events).expect("duplicate keyword");
    assert_eq!(info.get("kwargs"), Some(&json!(["arg1"])));

    let query = pprint_call(
        vec![lit(1i64), lit(2i64), lit(3i64), lit("newp")],
        Vec::new(),
    )?;
    let events = rt.events(query, QueryOpts::default());
    let (_, info) = common::error(&events).expect("surplus positional");
    assert_eq!(info.get("valu"), Some(&json!("newp")));
    assert!(common::prints(&events).is_empty());
    Ok(())
}

#[test]
fn return_delivers_a_value() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .function("add", &["a", "b"], |q| {
            q.ret(Some(binop(BinOp::Add, var("a"), var("b"))))
                .call(print(lit("unreached")))
        })
        .call(print(call(var("add"), vec![lit(1i64), lit(2i64)])))
        .function("nothing", &[], |q| q.ret(None))
        .call(print(call(var("nothing"), Vec::new())))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["3", "null"]);
    Ok(())
}

#[test]
fn yielded_calls_stream_function_nodes() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .function("makeints", &[], |q| {
            q.edit(|e| {
                e.node("test:int", lit(1i64)).node("test:int", lit(2i64));
            })
        })
        .yield_expr(call(var("makeints"), Vec::new()))
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(common::reprs(&found), vec!["test:int=1", "test:int=2"]);
    Ok(())
}

#[test]
fn closures_see_later_outer_assignments() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .set_var("x", lit(1i64))
        .function("show", &[], |q| q.call(print(var("x"))))
        .set_var("x", lit(2i64))
        .call(call(var("show"), Vec::new()))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["2"]);
    Ok(())
}

#[test]
fn function_writes_stay_local() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .set_var("x", lit(1i64))
        .function("setx", &[], |q| {
            q.set_var("x", lit(5i64)).call(print(var("x"))).ret(None)
        })
        .call(call(var("setx"), Vec::new()))
        .call(print(var("x")))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["5", "1"]);
    Ok(())
}

#[test]
fn recursion_is_bounded() -> Result<()> {
    common::init_tracing();
    let opts = RuntimeOptions {
        max_call_depth: 4,
        ..RuntimeOptions::default()
    };
    let rt = Runtime::with_options(common::store()?, opts);
    let query = QueryBuilder::new()
        .function("recurse", &[], |q| q.call(call(var("recurse"), Vec::new())))
        .call(call(var("recurse"), Vec::new()))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("depth error");
    assert_eq!(kind, "StormRuntimeError");
    assert_eq!(info.get("name"), Some(&json!("recurse")));
    assert_eq!(info.get("depth"), Some(&json!(4)));
    Ok(())
}

#[test]
fn modules_expose_functions_and_variables() -> Result<()> {
    let rt = common::runtime()?;
    let module = QueryBuilder::new()
        .set_var("greeting", lit("hi"))
        .function("hello", &["who"], |q| {
            q.call(call_kw(
                lib("print"),
                vec![lit("{g} {w}")],
                vec![("g", var("greeting")), ("w", var("who"))],
            ))
        })
        .build()?;
    rt.add_module("test.mod", module);

    let query = QueryBuilder::new()
        .set_var("mod", call(lib("import"), vec![lit("test.mod")]))
        .call(method(var("mod"), "hello", vec![lit("visi")]))
        .call(print(deref(var("mod"), "greeting")))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["hi visi", "hi"]);

    let query = QueryBuilder::new()
        .call(call(lib("import"), vec![lit("newp")]))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("unknown module");
    assert_eq!(kind, "NoSuchName");
    assert_eq!(info.get("name"), Some(&json!("newp")));
    Ok(())
}

#[test]
fn unknown_lib_members_fail() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .call(call(lib("newp"), Vec::new()))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("unknown member");
    assert_eq!(kind, "NoSuchName");
    assert_eq!(info.get("name"), Some(&json!("$lib.newp")));
    Ok(())
}

#[test]
fn bodies_see_per_node_captures() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo")).set(":hehe", lit("bar"));
        })
        .set_var("v", prop("hehe"))
        .function("show", &[], |q| q.call(print(var("v"))).ret(Some(var("v"))))
        .set_var("r", call(var("show"), Vec::new()))
        .call(print(binop(BinOp::Add, lit("r="), var("r"))))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(common::error(&events).is_none(), "{events:?}");
    assert_eq!(common::prints(&events), vec!["bar", "r=bar"]);
    assert_eq!(common::nodes(&events).len(), 1);
    Ok(())
}
