mod common;

use std::sync::Arc;

use serde_json::json;
use storm::ast::*;
use storm::{Prim, QueryOpts, Result, RuleAuthorizer, Runtime};

#[test]
fn node_add_sets_props_and_auto_creates_refs() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:comp", list(vec![lit(10i64), lit("lulz")]));
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("hehe"), Some(&Prim::Int(10)));
    assert_eq!(found[0].get("haha"), Some(&Prim::from("lulz")));

    let ints = rt.nodes(QueryBuilder::new().lift_form("test:int").build()?, QueryOpts::default())?;
    assert_eq!(common::reprs(&ints), vec!["test:int=10"]);
    Ok(())
}

#[test]
fn deleting_an_unset_prop_is_a_no_op() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo")).del(":hehe");
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(common::error(&events).is_none());
    let found = common::nodes(&events);
    assert_eq!(found.len(), 1);
    assert!(found[0].get("hehe").is_none());
    Ok(())
}

#[test]
fn unknown_props_fail_the_query() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo")).set(":newp", lit("haha"));
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, _) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "NoSuchProp");

    let query = QueryBuilder::new()
        .lift_form("test:str")
        .edit(|e| {
            e.del(":newp");
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, _) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "NoSuchProp");
    Ok(())
}

#[test]
fn try_set_skips_bad_values() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.try_node("test:int", lit("notanint"));
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert!(events.is_empty(), "{events:?}");

    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo"))
                .try_set(":bar", lit("newp"))
                .set(":hehe", lit("haha"));
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert_eq!(found.len(), 1);
    assert!(found[0].get("bar").is_none());
    assert_eq!(found[0].get("hehe"), Some(&Prim::from("haha")));

    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit("notanint"));
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let (kind, info) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "BadTypeValu");
    assert_eq!(info.get("name"), Some(&json!("test:int")));
    Ok(())
}

#[test]
fn prop_names_may_come_from_variables() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .set_var("p", lit("hehe"))
        .edit(|e| {
            e.node("test:str", lit("foo")).set(":$p", lit("haha"));
        })
        .call(call(lib("print"), vec![prop("$p")]))
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::prints(&events), vec!["haha"]);
    assert_eq!(common::nodes(&events)[0].get("hehe"), Some(&Prim::from("haha")));
    Ok(())
}

#[test]
fn parens_scope_edits_to_the_new_node() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.parens("inet:fqdn", lit("VERTEX.link"), |_| {})
                .parens("ps:person", lit("*"), |p| {
                    p.set(":name", lit("visi"));
                })
                .parens("ps:contact", lit("*"), |p| {
                    p.set(":name", lit("visi")).tag("#foo");
                });
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    let forms: Vec<&str> = found.iter().map(|node| node.form.as_str()).collect();
    assert_eq!(forms, vec!["inet:fqdn", "ps:person", "ps:contact"]);
    assert_eq!(found[0].valu, Prim::from("vertex.link"));
    assert!(found[0].tags.is_empty());
    assert!(found[0].get("name").is_none());
    assert_eq!(found[1].get("name"), Some(&Prim::from("visi")));
    assert!(!found[1].has_tag("foo"));
    assert!(found[2].has_tag("foo"));
    Ok(())
}

#[test]
fn nested_parens_scope_to_the_innermost_node() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("inet:fqdn", lit("woot.com"))
                .parens("ps:person", lit("*"), |p| {
                    p.set(":name", lit("visi"))
                        .parens("ps:contact", lit("*"), |c| {
                            c.tag("#foo");
                        });
                });
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    let forms: Vec<&str> = found.iter().map(|node| node.form.as_str()).collect();
    assert_eq!(forms, vec!["inet:fqdn", "ps:person", "ps:contact"]);
    assert!(!found[0].has_tag("foo"));
    assert_eq!(found[1].get("name"), Some(&Prim::from("visi")));
    assert!(!found[1].has_tag("foo"));
    assert!(found[2].has_tag("foo"));
    assert!(found[2].get("name").is_none());
    Ok(())
}

#[test]
fn tags_bring_their_ancestors() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo")).tag("#Base.Tag1.child");
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    let tags: Vec<&str> = found[0].tags.keys().map(String::as_str).collect();
    assert_eq!(tags, vec!["base", "base.tag1", "base.tag1.child"]);

    let syn = rt.nodes(QueryBuilder::new().lift_form("syn:tag").build()?, QueryOpts::default())?;
    let mut names = common::reprs(&syn);
    names.sort();
    assert_eq!(
        names,
        vec!["syn:tag=base", "syn:tag=base.tag1", "syn:tag=base.tag1.child"]
    );

    let query = QueryBuilder::new()
        .lift_tag("#base.tag1")
        .edit(|e| {
            e.untag("#base.tag1");
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    let tags: Vec<&str> = found[0].tags.keys().map(String::as_str).collect();
    assert_eq!(tags, vec!["base"]);
    Ok(())
}

#[test]
fn tag_props_are_set_and_removed() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(10i64)).tag_prop("#foo.bar", "score", lit("5"));
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert!(found[0].has_tag("foo"));
    let key = ("foo.bar".to_owned(), "score".to_owned());
    assert_eq!(found[0].tagprops.get(&key), Some(&Prim::Int(5)));

    let query = QueryBuilder::new()
        .lift_form("test:int")
        .edit(|e| {
            e.del_tag_prop("#foo.bar", "score");
        })
        .build()?;
    let found = rt.nodes(query, QueryOpts::default())?;
    assert!(found[0].tagprops.is_empty());
    assert!(found[0].has_tag("foo.bar"));

    let query = QueryBuilder::new()
        .lift_form("test:int")
        .edit(|e| {
            e.tag_prop("#foo", "newp", lit(1i64));
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    assert_eq!(common::error(&events).map(|(kind, _)| kind).as_deref(), Some("NoSuchProp"));
    Ok(())
}

#[test]
fn authorizer_denies_unpermitted_edits() -> Result<()> {
    let auth = RuleAuthorizer::new().allow("visi", "node.add.test:str");
    let rt = Runtime::new(common::store()?).with_authorizer(Arc::new(auth));

    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:str", lit("foo"));
        })
        .build()?;
    assert_eq!(rt.nodes(query, QueryOpts::user("visi"))?.len(), 1);

    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(10i64));
        })
        .build()?;
    let events = rt.events(query, QueryOpts::user("visi"));
    let (kind, info) = common::error(&events).expect("terminal error");
    assert_eq!(kind, "AuthDeny");
    assert_eq!(info.get("user"), Some(&json!("visi")));
    assert_eq!(info.get("perm"), Some(&json!("node.add.test:int")));

    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:int", lit(10i64));
        })
        .build()?;
    assert_eq!(rt.nodes(query, QueryOpts::default())?.len(), 1);
    Ok(())
}

#[test]
fn deprecated_props_warn_but_apply() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:dep:easy", lit("foo")).set(":guid", lit("bar"));
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let warns = common::warns(&events);
    assert_eq!(warns.len(), 1);
    assert!(warns[0].0.contains("test:dep:easy:guid"), "{}", warns[0].0);
    assert_eq!(warns[0].1.get("name"), Some(&json!("test:dep:easy:guid")));
    assert_eq!(common::nodes(&events)[0].get("guid"), Some(&Prim::from("bar")));
    Ok(())
}

#[test]
fn deprecated_forms_warn_once_per_query() -> Result<()> {
    let rt = common::runtime()?;
    let query = QueryBuilder::new()
        .edit(|e| {
            e.node("test:dep:old", lit("foo")).node("test:dep:old", lit("bar"));
        })
        .build()?;
    let events = rt.events(query, QueryOpts::default());
    let warns = common::warns(&events);
    assert_eq!(warns.len(), 1);
    assert_eq!(warns[0].0, "The form test:dep:old is deprecated");
    assert_eq!(common::nodes(&events).len(), 2);
    Ok(())
}
