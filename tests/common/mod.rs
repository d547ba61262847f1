#![allow(dead_code)]

use std::sync::{Arc, Once};

use storm::error::Info;
use storm::model::{DefInfo, Model, PropSpec, TypeOpts};
use storm::storage::MemoryStore;
use storm::{Event, Node, Result, Runtime};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("storm=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_test_writer()
            .try_init();
    });
}

/// Data model shared by the integration tests.
pub fn model() -> Result<Model> {
    let mut model = Model::new();
    model.add_type("test:int", "int", TypeOpts::default(), DefInfo::default())?;
    model.add_type("test:str", "str", TypeOpts::default(), DefInfo::default())?;
    model.add_type(
        "test:comp",
        "comp",
        TypeOpts::comp(&[("hehe", "test:int"), ("haha", "str")]),
        DefInfo::default(),
    )?;
    model.add_type("test:arrayprop", "guid", TypeOpts::default(), DefInfo::default())?;
    model.add_type("test:refs", "guid", TypeOpts::default(), DefInfo::default())?;
    model.add_type("inet:fqdn", "str", TypeOpts::lower(), DefInfo::default())?;
    model.add_type("inet:ipv4", "int", TypeOpts::default(), DefInfo::default())?;
    model.add_type(
        "inet:dns:a",
        "comp",
        TypeOpts::comp(&[("fqdn", "inet:fqdn"), ("ipv4", "inet:ipv4")]),
        DefInfo::default(),
    )?;
    model.add_type("ps:person", "guid", TypeOpts::default(), DefInfo::default())?;
    model.add_type("ps:contact", "guid", TypeOpts::default(), DefInfo::default())?;
    model.add_type("test:dep:str", "str", TypeOpts::default(), DefInfo::deprecated())?;
    model.add_type("test:dep:easy", "str", TypeOpts::default(), DefInfo::default())?;
    model.add_type("test:dep:old", "str", TypeOpts::default(), DefInfo::default())?;

    model.add_form("test:int", DefInfo::default(), vec![PropSpec::new("loc", "str")])?;
    model.add_form(
        "test:str",
        DefInfo::default(),
        vec![
            PropSpec::new("hehe", "str"),
            PropSpec::new("tick", "time"),
            PropSpec::new("bar", "ndef"),
        ],
    )?;
    model.add_form(
        "test:comp",
        DefInfo::default(),
        vec![PropSpec::new("hehe", "test:int"), PropSpec::new("haha", "str")],
    )?;
    model.add_form(
        "test:arrayprop",
        DefInfo::default(),
        vec![
            PropSpec::with_opts("ints", "array", TypeOpts::array("test:int")),
            PropSpec::with_opts("strs", "array", TypeOpts::array("test:str")),
        ],
    )?;
    model.add_form(
        "test:refs",
        DefInfo::default(),
        vec![
            PropSpec::new("ref", "ndef"),
            PropSpec::with_opts("refs", "array", TypeOpts::array("ndef")),
        ],
    )?;
    model.add_form("inet:fqdn", DefInfo::default(), vec![PropSpec::new("zone", "inet:fqdn")])?;
    model.add_form("inet:ipv4", DefInfo::default(), vec![PropSpec::new("asn", "int")])?;
    model.add_form(
        "inet:dns:a",
        DefInfo::default(),
        vec![PropSpec::new("fqdn", "inet:fqdn"), PropSpec::new("ipv4", "inet:ipv4")],
    )?;
    model.add_form("ps:person", DefInfo::default(), vec![PropSpec::new("name", "str")])?;
    model.add_form(
        "ps:contact",
        DefInfo::default(),
        vec![PropSpec::new("name", "str"), PropSpec::new("person", "ps:person")],
    )?;
    model.add_form("test:dep:easy", DefInfo::default(), vec![PropSpec::new("guid", "test:dep:str")])?;
    model.add_form("test:dep:old", DefInfo::deprecated(), Vec::new())?;

    model.add_univ_prop(PropSpec::with_opts("univarray", "array", TypeOpts::array("int")))?;
    model.add_tag_prop(PropSpec::new("score", "int"))?;
    Ok(model)
}

pub fn store() -> Result<Arc<MemoryStore>> {
    init_tracing();
    Ok(Arc::new(MemoryStore::new(model()?)))
}

pub fn runtime() -> Result<Runtime> {
    Ok(Runtime::new(store()?))
}

pub fn nodes(events: &[Event]) -> Vec<Node> {
    events.iter().filter_map(Event::node).cloned().collect()
}

pub fn prints(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Print { mesg } => Some(mesg.clone()),
            _ => None,
        })
        .collect()
}

pub fn warns(events: &[Event]) -> Vec<(String, Info)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Warn { mesg, info } => Some((mesg.clone(), info.clone())),
            _ => None,
        })
        .collect()
}

/// Kind and detail of the terminal error, which must be the last event.
pub fn error(events: &[Event]) -> Option<(String, Info)> {
    match events.last() {
        Some(Event::Err { kind, info }) => Some((kind.clone(), info.clone())),
        _ => None,
    }
}

pub fn reprs(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(Node::repr).collect()
}
