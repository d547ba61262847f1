//! Storm: a streaming query language runtime over a property graph.
//!
//! Queries are trees of pipeline operators built with [`ast::QueryBuilder`].
//! A [`Runtime`] executes them lazily against a [`storage::Storage`]
//! collaborator and delivers an [`EventStream`] of nodes, messages and at most
//! one terminal error.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use storm::ast::{lit, QueryBuilder};
//! use storm::model::Model;
//! use storm::storage::MemoryStore;
//! use storm::{QueryOpts, Runtime};
//!
//! # fn main() -> storm::Result<()> {
//! let runtime = Runtime::new(Arc::new(MemoryStore::new(Model::new())));
//! let query = QueryBuilder::new()
//!     .edit(|e| {
//!         e.node("syn:tag", lit("hehe.haha"));
//!     })
//!     .build()?;
//! for node in runtime.nodes(query, QueryOpts::default())? {
//!     println!("{}", node.repr());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod analyze;
pub mod ast;
pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod prim;
pub mod profile;
pub mod runtime;
pub mod spooled;
pub mod storage;
pub mod value;

pub use config::RuntimeOptions;
pub use error::{Result, StormError};
pub use node::Node;
pub use prim::Prim;
pub use runtime::{Authorizer, Event, EventStream, QueryOpts, RuleAuthorizer, Runtime};
