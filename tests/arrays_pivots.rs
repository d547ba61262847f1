mod common;

use serde_json::json;
use storm::ast::*;
use storm::{Prim, QueryOpts, Result, Runtime};

fn sorted(mut reprs: Vec<String>) -> Vec<String> {
    reprs.sort();
    reprs
}

fn with_arrays(rt: &Runtime) -> Result<()> {
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:arrayprop", lit("*"))
                .set(":ints", list(vec![lit(1i64), lit("2"), lit(3i64)]));
        })
        .build()?;
    rt.nodes(query, QueryOpts::default())?;
    Ok(())
}

fn count(rt: &Runtime, query: QueryBuilder) -> Result<usize> {
    Ok(rt.nodes(query.build()?, QueryOpts::default())?.len())
}

#[test]
fn array_props_normalize_and_create_elements() -> Result<()> {
    let rt = common::runtime()?;
    with_arrays(&rt)?;
    let found = rt.nodes(
        QueryBuilder::new().lift_form("test:arrayprop").build()?,
        QueryOpts::default(),
    )?;
    assert_eq!(
        found[0].get("ints"),
        Some(&Prim::List(vec![Prim::Int(1), Prim::Int(2), Prim::Int(3)]))
    );
    let ints = rt.nodes(QueryBuilder::new().lift_form("test:int").build()?, QueryOpts::default())?;
    assert_eq!(
        sorted(common::reprs(&ints)),
        vec!["test:int=1", "test:int=2", "test:int=3"]
    );
    Ok(())
}

#[test]
fn array_filters_and_lifts_match_any_element() -> Result<()> {
    let rt = common::runtime()?;
    with_arrays(&rt)?;
    let lift = || QueryBuilder::new().lift_form("test:arrayprop");

    assert_eq!(count(&rt, lift().filter(array_cmp(":ints", "=", lit(2i64))?))?, 1);
    assert_eq!(count(&rt, lift().filter(array_cmp(":ints", "=", lit(5i64))?))?, 0);
    assert_eq!(count(&rt, lift().exclude(array_cmp(":ints", "=", lit(5i64))?))?, 1);
    assert_eq!(
        count(
            &rt,
            lift().filter(array_cmp(":ints", "range=", list(vec![lit(3i64), lit(9i64)]))?)
        )?,
        1
    );
    assert_eq!(
        count(
            &rt,
            lift().filter(array_cmp(":ints", ">", lit(3i64))?)
        )?,
        0
    );

    let lifted = QueryBuilder::new().lift_array("test:arrayprop:ints", "=", lit(3i64));
    assert_eq!(count(&rt, lifted)?, 1);
    let lifted = QueryBuilder::new().lift_array("test:arrayprop:ints", "=", lit(4i64));
    assert_eq!(count(&rt, lifted)?, 0);
    Ok(())
}

#[test]
fn array_syntax_requires_array_props() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo")).set(":hehe", lit("bar"));
        })
        .filter(array_cmp(":hehe", "=", lit("bar"))?)
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("filter on scalar prop");
    assert_eq!(kind, "BadCmprType");
    assert_eq!(
        info.get("mesg"),
        Some(&json!("Array filter syntax is only valid on array types"))
    );

    let query = QueryBuilder::new()
        .lift_array("test:str:hehe", "=", lit("bar"))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, _) = common::error(&events).expect("lift on scalar prop");
    assert_eq!(kind, "BadCmprType");
    Ok(())
}

#[test]
fn bad_comparators_fail_even_when_the_prop_is_unset() -> Result<()> {
    let rt = common::runtime()?;
    let setup = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo"))
                .parens("test:str", lit("bar"), |p| {
                    p.set(":hehe", lit("haha"));
                });
        })
        .build()?;
    rt.nodes(setup, QueryOpts::default())?;

    let query = QueryBuilder::new()
        .lift_form("test:str")
        .filter(prop_cmp(":hehe", "^~=", lit("x"))?)
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(common::nodes(&events).is_empty());
    let (kind, info) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "NoSuchCmpr");
    assert_eq!(info.get("cmpr"), Some(&json!("^~=")));
    Ok(())
}

#[test]
fn array_prop_pivots_follow_each_element() -> Result<()> {
    let rt = common::runtime()?;
    with_arrays(&rt)?;
    let query = QueryBuilder::new()
        .lift_form("test:arrayprop")
        .prop_pivot(":ints", "test:int")
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(
        common::reprs(&found),
        vec!["test:int=1", "test:int=2", "test:int=3"]
    );

    let query = QueryBuilder::new()
        .lift("test:int", "=", lit(2i64))
        .pivot_in("test:arrayprop")
        .build()?;
    assert_eq!(rt.nodes(query, QueryOpts::default())?.len(), 1);
    Ok(())
}

#[test]
fn unset_array_props_pivot_to_nothing() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:arrayprop", lit("*"));
        })
        .prop_pivot(":ints", "*")
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(events.is_empty(), "{events:?}");
    Ok(())
}

#[test]
fn comp_forms_pivot_both_ways() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:comp", list(vec![lit(10i64), lit("lulz")]));
        })
        .build()?;
    rt.nodes(query, QueryOpts::default())?;

    let forward = QueryBuilder::new()
        .lift_form("test:comp")
        .pivot_out("test:int")
        .build()?;
    assert_eq!(
        common::reprs(&rt.nodes(forward, QueryOpts::default())?),
        vec!["test:int=10"]
    );

    let back = QueryBuilder::new()
        .lift_form("test:int")
        .pivot_in("test:comp")
        .build()?;
    assert_eq!(
        common::reprs(&rt.nodes(back, QueryOpts::default())?),
        vec!["test:comp=(10, lulz)"]
    );

    let reverse = QueryBuilder::new()
        .lift_form("test:int")
        .pivot_out("test:comp")
        .build()?;
    assert_eq!(rt.nodes(reverse, QueryOpts::default())?.len(), 1);
    Ok(())
}

#[test]
fn unrelated_forms_do_not_pivot() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(10i64));
        })
        .pivot_out("inet:fqdn")
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("no pivot");
    assert_eq!(kind, "NoSuchPivot");
    assert_eq!(info.get("src"), Some(&json!("test:int")));
    assert_eq!(info.get("dst"), Some(&json!("inet:fqdn")));
    Ok(())
}

#[test]
fn wildcard_pivots_follow_every_reference() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("inet:dns:a", list(vec![lit("WOOT.com"), lit(16909060i64)]));
        })
        .pivot_out("*")
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(
        sorted(common::reprs(&found)),
        vec!["inet:fqdn=woot.com", "inet:ipv4=16909060"]
    );

    let query = QueryBuilder::new()
        .lift_form("inet:fqdn")
        .pivot_in("*")
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(common::reprs(&found), vec!["inet:dns:a=(woot.com, 16909060)"]);
    Ok(())
}

#[test]
fn tag_pivots_reach_syn_tag_nodes() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo"))
                .tag("#base.tag1")
                .tag("#base.tag2")
                .tag("#other");
        })
        .pivot_out("#base.*")
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(
        sorted(common::reprs(&found)),
        vec!["syn:tag=base.tag1", "syn:tag=base.tag2"]
    );
    Ok(())
}

#[test]
fn ndef_props_pivot_to_the_named_node() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo"))
                .set(":bar", list(vec![lit("test:int"), lit("10")]));
        })
        .prop_pivot(":bar", "*")
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(common::reprs(&found), vec!["test:int=10"]);

    let query = QueryBuilder::new()
        .lift_form("test:int")
        .pivot_in("test:str")
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(common::reprs(&found), vec!["test:str=foo"]);
    Ok(())
}
