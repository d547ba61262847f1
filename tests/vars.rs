mod common;

use serde_json::json;
use storm::ast::*;
use storm::{Event, QueryOpts, Result};

fn print(expr: Expr) -> Expr {
    call(lib("print"), vec![expr])
}

#[test]
fn subquery_assignment_smashes_outer_variable() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .set_var("loc", lit("newp"))
        .edit(|e| {
            e.node("test:comp", list(vec![lit(10i64), lit("lulz")]));
        })
        .subquery(|q| {
            q.pivot_out("test:int")
                .edit(|e| {
                    e.set(":loc", lit("haha"));
                })
                .set_var("loc", prop("loc"))
        })
        .call(print(var("loc")))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(events.len(), 2, "{events:?}");
    assert_eq!(events[0], Event::Print { mesg: "haha".into() });
    assert_eq!(
        events[1].node().map(|node| node.form.as_str()),
        Some("test:comp")
    );
    Ok(())
}

#[test]
fn subquery_bindings_reach_the_outer_pipeline() -> Result<()> {
    let rt = common::runtime()?;
    let setup = QueryBuilder::new()
        .edit(|e| {
            e.node("test:comp", list(vec![lit(30i64), lit("w00t")]))
                .node("test:comp", list(vec![lit(40i64), lit("w00t")]));
        })
        .build()?;
    rt.nodes(setup, QueryOpts::default())?;
    let locs = QueryBuilder::new()
        .edit(|e| {
            e.parens("test:int", lit(30i64), |p| {
                p.set(":loc", lit("sol"));
            })
            .parens("test:int", lit(40i64), |p| {
                p.set(":loc", lit("mars"));
            });
        })
        .build()?;
    rt.nodes(locs, QueryOpts::default())?;

    let query = QueryBuilder::new()
        .lift("test:comp:haha", "=", lit("w00t"))
        .subquery(|q| q.pivot_out("test:int").set_var("loc", prop("loc")))
        .call(print(var("loc")))
        .exclude(is_form("test:comp"))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(common::error(&events).is_none(), "{events:?}");
    assert!(common::nodes(&events).is_empty());
    let mut prints = common::prints(&events);
    prints.sort();
    assert_eq!(prints, vec!["mars", "sol"]);
    Ok(())
}

#[test]
fn derefs_chain_through_dicts() -> Result<()> {
    let rt = common::runtime()?;
    let inner = call_kw(lib("dict"), Vec::new(), vec![("b", lit(5i64))]);
    let query = QueryBuilder::new()
        .set_var("d", call_kw(lib("dict"), Vec::new(), vec![("a", inner)]))
        .call(print(deref(deref(var("d"), "a"), "b")))
        .set_var("key", lit("a"))
        .call(print(deref(deref(var("d"), "$key"), "b")))
        .call(print(deref(var("d"), "newp")))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["5", "5"]);
    let (kind, info) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "BadPropValu");
    assert_eq!(info.get("name"), Some(&json!("newp")));
    Ok(())
}

#[test]
fn item_assignment_mutates_containers() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .set_var("d", call(lib("dict"), Vec::new()))
        .set_item(var("d"), "hehe", lit("haha"))
        .call(print(deref(var("d"), "hehe")))
        .set_var("l", call(lib("list"), vec![lit(1i64), lit(2i64)]))
        .set_item(var("l"), "1", lit(9i64))
        .call(print(var("l")))
        .set_var("i", lit(5i64))
        .set_item(var("i"), "x", lit(1i64))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["haha", "(1, 9)"]);
    let (kind, info) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "StormRuntimeError");
    assert_eq!(info.get("mesg"), Some(&json!("Int does not support assignment.")));
    Ok(())
}

#[test]
fn containers_may_hold_themselves() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .set_var("l", call(lib("list"), Vec::new()))
        .call(method(var("l"), "append", vec![var("l")]))
        .call(print(var("l")))
        .set_var("s", call(lib("set"), Vec::new()))
        .call(method(var("s"), "add", vec![var("s")]))
        .call(print(method(var("s"), "size", Vec::new())))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(common::error(&events).is_none(), "{events:?}");
    assert_eq!(common::prints(&events), vec!["((...))", "1"]);
    Ok(())
}

#[test]
fn for_loops_unpack_break_and_continue() -> Result<()> {
    let rt = common::runtime()?;
    let two = binop(BinOp::Eq, var("x"), lit(2i64));
    let four = binop(BinOp::Eq, var("x"), lit(4i64));
    let query = QueryBuilder::new()
        .for_each(
            &["x"],
            list(vec![lit(1i64), lit(2i64), lit(3i64), lit(4i64)]),
            |q| {
                q.if_else(two, |q| q.cont(), None::<fn(QueryBuilder) -> QueryBuilder>)
                    .if_else(four, |q| q.brk(), None::<fn(QueryBuilder) -> QueryBuilder>)
                    .call(print(var("x")))
            },
        )
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["1", "3"]);

    let pairs = call_kw(lib("dict"), Vec::new(), vec![("a", lit(1i64)), ("b", lit(2i64))]);
    let query = QueryBuilder::new()
        .for_each(&["k", "v"], pairs, |q| {
            q.call(call_kw(
                lib("print"),
                vec![lit("{k}={v}")],
                vec![("k", var("k")), ("v", var("v"))],
            ))
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["a=1", "b=2"]);
    Ok(())
}

#[test]
fn for_loop_runs_once_per_inbound_node() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(1i64)).node("test:int", lit(2i64));
        })
        .for_each(&["x"], list(vec![lit("a"), lit("b")]), |q| {
            q.call(call_kw(
                lib("print"),
                vec![lit("{n} {x}")],
                vec![("n", node()), ("x", var("x"))],
            ))
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(
        common::prints(&events),
        vec![
            "test:int=1 a",
            "test:int=1 b",
            "test:int=2 a",
            "test:int=2 b"
        ]
    );
    assert_eq!(common::nodes(&events).len(), 4);
    Ok(())
}

#[test]
fn if_elif_else_picks_one_arm() -> Result<()> {
    let rt = common::runtime()?;
    for (valu, want) in [(1i64, "one"), (2, "two"), (3, "other")] {
        let arm = |text: &str| QueryBuilder::new().call(print(lit(text))).build();
        let query = QueryBuilder::new()
            .set_var("x", lit(valu))
            .if_chain(
                vec![
                    (binop(BinOp::Eq, var("x"), lit(1i64)), arm("one")?),
                    (binop(BinOp::Eq, var("x"), lit(2i64)), arm("two")?),
                ],
                Some(arm("other")?),
            )
            .build()?;
        let events = rt.events(query, QueryOpts::default());
        assert_eq!(common::prints(&events), vec![want]);
    }
    Ok(())
}

#[test]
fn init_and_fini_bracket_the_pipeline() -> Result<()> {
    let rt = common::runtime()?;
    let setup = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(1i64))
                .node("test:int", lit(2i64))
                .node("test:int", lit(3i64));
        })
        .build()?;
    rt.nodes(setup, QueryOpts::default())?;

    let query = QueryBuilder::new()
        .init(|q| q.set_var("x", lit(0i64)).call(print(lit("init"))))
        .lift_form("test:int")
        .set_var("x", binop(BinOp::Add, var("x"), lit(1i64)))
        .fini(|q| {
            q.call(call_kw(
                lib("print"),
                vec![lit("count {n}")],
                vec![("n", var("x"))],
            ))
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(events.len(), 5, "{events:?}");
    assert_eq!(events[0], Event::Print { mesg: "init".into() });
    assert!(events[1..4].iter().all(|event| event.node().is_some()));
    assert_eq!(events[4], Event::Print { mesg: "count 3".into() });
    Ok(())
}

#[test]
fn tallies_bridge_init_and_fini() -> Result<()> {
    let rt = common::runtime()?;
    let setup = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(1i64))
                .node("test:int", lit(2i64))
                .node("test:int", lit(3i64));
        })
        .build()?;
    rt.nodes(setup, QueryOpts::default())?;

    let query = QueryBuilder::new()
        .init(|q| q.set_var("tally", call(lib("stats.tally"), Vec::new())))
        .lift_form("test:int")
        .call(method(var("tally"), "inc", vec![lit("node")]))
        .spin()
        .fini(|q| {
            q.for_each(&["name", "total"], var("tally"), |q| {
                q.call(call_kw(
                    lib("fire"),
                    Vec::new(),
                    vec![("name", var("name")), ("total", var("total"))],
                ))
            })
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(common::error(&events).is_none(), "{events:?}");
    let fired: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Fire { name, data } => Some((name.as_str(), data.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(fired.len(), 1, "{events:?}");
    assert_eq!(fired[0].0, "node");
    assert_eq!(fired[0].1.get("total"), Some(&json!(3)));
    assert_eq!(fired[0].1.len(), 1);
    assert!(common::nodes(&events).is_empty());
    Ok(())
}

#[test]
fn init_runs_once_with_input_nodes() -> Result<()> {
    let rt = common::runtime()?;
    let setup = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(1i64)).node("test:int", lit(2i64));
        })
        .build()?;
    let input = rt.nodes(setup, QueryOpts::default())?;

    let query = QueryBuilder::new()
        .init(|q| q.call(print(lit("init"))))
        .build()?;
    let events = rt.events(query, QueryOpts::default().input(input));
    assert_eq!(common::prints(&events), vec!["init"]);
    assert_eq!(common::nodes(&events).len(), 2);
    Ok(())
}

#[test]
fn init_must_not_read_the_node() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .init(|q| q.call(print(node())))
        .lift_form("test:int")
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(events.len(), 1);
    let (kind, info) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "StormRuntimeError");
    assert_eq!(info.get("mesg"), Some(&json!("Init block query must be runtsafe")));
    Ok(())
}

#[test]
fn missing_variables_name_the_variable() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new().call(print(var("newp"))).build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "NoSuchVar");
    assert_eq!(info.get("name"), Some(&json!("newp")));
    Ok(())
}
