mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use storm::ast::*;
use storm::{QueryOpts, Result, Runtime, RuntimeOptions};

fn seeded(opts: RuntimeOptions) -> Result<Runtime> {
    let rt = Runtime::with_options(common::store()?, opts);
    let query = QueryBuilder::new()
        .for_each(
            &["i"],
            list((1..=5).map(|i: i64| lit(i)).collect()),
            |q| {
                q.edit(|e| {
                    e.node("test:int", var("i"));
                })
            },
        )
        .build()?;
    rt.nodes(query, QueryOpts::default())?;
    Ok(rt)
}

#[test]
fn pulling_advances_only_as_far_as_needed() -> Result<()> {
    let rt = seeded(RuntimeOptions::default())?;
    let query = QueryBuilder::new()
        .lift_form("test:int")
        .edit(|e| {
            e.set(":loc", lit("seen"));
        })
        .build()?;
    let mut stream = rt.stream(query, QueryOpts::default());
    let first = stream.next().and_then(|event| event.node().cloned());
    assert_eq!(first.map(|node| node.repr()).as_deref(), Some("test:int=1"));
    drop(stream);

    let seen = QueryBuilder::new().lift_has("test:int:loc").build()?;
    assert_eq!(rt.nodes(seen, QueryOpts::default())?.len(), 1);
    Ok(())
}

#[test]
fn cancel_ends_the_stream_quietly() -> Result<()> {
    let rt = seeded(RuntimeOptions::default())?;
    let query = QueryBuilder::new().lift_form("test:int").build()?;
    let mut stream = rt.stream(query, QueryOpts::default());
    assert!(stream.next().is_some());
    stream.cancel();
    assert_eq!(stream.next(), None);
    assert!(stream.error().is_none());

    let flag = Arc::new(AtomicBool::new(true));
    let opts = QueryOpts {
        cancel: Some(Arc::clone(&flag)),
        ..QueryOpts::default()
    };
    let query = QueryBuilder::new().lift_form("test:int").build()?;
    assert!(rt.events(query, opts).is_empty());
    assert!(flag.load(Ordering::Relaxed));
    Ok(())
}

#[test]
fn timeouts_cancel_the_query() -> Result<()> {
    let opts = RuntimeOptions {
        timeout_ms: Some(0),
        ..RuntimeOptions::default()
    };
    let rt = Runtime::with_options(common::store()?, opts);
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(1i64));
        })
        .build()?;
    assert!(rt.events(query, QueryOpts::default()).is_empty());
    Ok(())
}

#[test]
fn uniq_drops_repeats_even_after_spilling() -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let rt = seeded(RuntimeOptions {
        spool_threshold: 2,
        scratch_dir: Some(scratch.path().to_path_buf()),
        ..RuntimeOptions::default()
    })?;
    let query = QueryBuilder::new()
        .lift_form("test:int")
        .lift_form("test:int")
        .uniq()
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(
        common::reprs(&found),
        vec!["test:int=1", "test:int=2", "test:int=3", "test:int=4", "test:int=5"]
    );
    Ok(())
}

#[test]
fn limit_and_spin() -> Result<()> {
    let rt = seeded(RuntimeOptions::default())?;
    let query = QueryBuilder::new()
        .lift_form("test:int")
        .limit(lit(2i64))
        .build()?;
    assert_eq!(rt.nodes(query, QueryOpts::default())?.len(), 2);

    let query = QueryBuilder::new()
        .lift_form("test:int")
        .edit(|e| {
            e.set(":loc", lit("spun"));
        })
        .spin()
        .build()?;
    assert!(rt.nodes(query, QueryOpts::default())?.is_empty());

    let query = QueryBuilder::new()
        .lift("test:int:loc", "=", lit("spun"))
        .build()?;
    assert_eq!(rt.nodes(query, QueryOpts::default())?.len(), 5);
    Ok(())
}

#[test]
fn input_nodes_feed_the_first_operator() -> Result<()> {
    let rt = seeded(RuntimeOptions::default())?;
    let input = rt.nodes(
        QueryBuilder::new().lift("test:int", "<", lit(3i64)).build()?,
        QueryOpts::default(),
    )?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.set(":loc", lit("input"));
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default().input(input))?;
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|node| node.get("loc").is_some()));
    Ok(())
}

#[test]
fn filters_keep_and_exclude() -> Result<()> {
    let rt = seeded(RuntimeOptions::default())?;
    let query = QueryBuilder::new()
        .lift_form("test:int")
        .filter(abs_cmp("test:int", ">=", lit(4i64)))
        .build()?;
    assert_eq!(
        common::reprs(&rt.nodes(query, QueryOpts::default())?),
        vec!["test:int=4", "test:int=5"]
    );

    let query = QueryBuilder::new()
        .lift_form("test:int")
        .exclude(expr_cond(binop(BinOp::Lt, call(deref(node(), "value"), Vec::new()), lit(5i64))))
        .build()?;
    assert_eq!(
        common::reprs(&rt.nodes(query, QueryOpts::default())?),
        vec!["test:int=5"]
    );
    Ok(())
}
