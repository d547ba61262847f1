//! Query execution.
//!
//! A [`Runtime`] binds a [`Storage`] collaborator to runtime options, an
//! optional [`Authorizer`], and the storm modules available to `$lib.import`.
//! [`Runtime::stream`] turns a query into a lazy [`EventStream`]: nothing runs
//! until the consumer pulls, and each pull advances the pipeline only far enough
//! to produce the next event.

mod auth;
mod call;
mod control;
mod edit;
mod eval;
mod library;
mod methods;
mod pivot;
mod runt;
mod scope;
mod stages;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::analyze;
use crate::ast::Query;
use crate::config::RuntimeOptions;
use crate::error::{Info, Result, StormError};
use crate::node::Node;
use crate::storage::Storage;
use crate::value::Value;

pub use auth::{Authorizer, RuleAuthorizer};
pub(crate) use scope::Frame;

use runt::{Runt, RuntParts};
use stages::{build_query, BoxStage, Flow, Seed};

/// Item delivered to the consumer of a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// A node leaving the end of the pipeline.
    Node(Node),
    /// `$lib.print` output.
    Print {
        /// Formatted message.
        mesg: String,
    },
    /// `$lib.warn` output or a deprecation notice.
    Warn {
        /// Formatted message.
        mesg: String,
        /// Keyword detail.
        info: Info,
    },
    /// Terminal failure. Nothing follows it.
    Err {
        /// Stable error kind, see [`StormError::code`].
        kind: String,
        /// Structured detail, see [`StormError::info`].
        info: Info,
    },
    /// `$lib.fire` output.
    Fire {
        /// Event name.
        name: String,
        /// Keyword payload.
        data: Info,
    },
}

impl Event {
    /// The node carried by a node event.
    pub fn node(&self) -> Option<&Node> {
        match self {
            Event::Node(node) => Some(node),
            _ => None,
        }
    }
}

/// Per-query inputs.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    /// User checked against the authorizer before edits.
    pub user: Option<String>,
    /// Variables bound in the root frame before the query starts.
    pub vars: serde_json::Map<String, serde_json::Value>,
    /// Shared cancellation flag. A fresh one is created when absent.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Nodes fed into the first operator.
    pub input: Vec<Node>,
}

impl QueryOpts {
    /// Options with a bound user.
    pub fn user(user: &str) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Adds a root variable.
    pub fn var(mut self, name: &str, valu: impl Into<serde_json::Value>) -> Self {
        self.vars.insert(name.into(), valu.into());
        self
    }

    /// Adds input nodes.
    pub fn input(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.input.extend(nodes);
        self
    }
}

/// Entry point for running storm queries against a store.
pub struct Runtime {
    store: Arc<dyn Storage>,
    opts: Arc<RuntimeOptions>,
    auth: Option<Arc<dyn Authorizer>>,
    modules: RwLock<Arc<FxHashMap<String, Arc<Query>>>>,
}

impl Runtime {
    /// Runtime with default options and no authorizer.
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self::with_options(store, RuntimeOptions::default())
    }

    /// Runtime with explicit options.
    pub fn with_options(store: Arc<dyn Storage>, opts: RuntimeOptions) -> Self {
        Self {
            store,
            opts: Arc::new(opts),
            auth: None,
            modules: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    /// Installs the authorizer consulted when a query runs as a user.
    pub fn with_authorizer(mut self, auth: Arc<dyn Authorizer>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Options shared by every query.
    pub fn options(&self) -> &RuntimeOptions {
        &self.opts
    }

    /// Registers a module for `$lib.import(name)`, replacing any previous one.
    pub fn add_module(&self, name: &str, query: Query) {
        let mut modules = self.modules.write();
        Arc::make_mut(&mut modules).insert(name.to_owned(), Arc::new(query));
        debug!(module = name, "storm.runtime.add_module");
    }

    /// Starts a query. Work happens as the returned stream is pulled.
    pub fn stream(&self, query: impl Into<Arc<Query>>, opts: QueryOpts) -> EventStream {
        let query = query.into();
        let cancel = opts.cancel.unwrap_or_default();
        let runt = Runt::new(RuntParts {
            store: Arc::clone(&self.store),
            opts: Arc::clone(&self.opts),
            user: opts.user.clone(),
            auth: self.auth.clone(),
            modules: Arc::clone(&self.modules.read()),
            cancel,
        });
        let root = Frame::root();
        for (name, valu) in &opts.vars {
            root.define(name, Value::from_json(valu));
        }
        info!(
            user = opts.user.as_deref().unwrap_or(""),
            opers = query.opers.len(),
            "storm.query.start"
        );
        let mut stream = EventStream {
            runt,
            root,
            stage: None,
            error: None,
            finished: false,
            nodes: 0,
        };
        match analyze::analyze(&query) {
            Ok(()) => {
                let seed = Seed::new(opts.input);
                stream.stage = Some(build_query(&query, &stream.root, seed, &stream.runt));
            }
            Err(err) => stream.fail(err),
        }
        stream
    }

    /// Runs a query to completion and collects every event.
    pub fn events(&self, query: impl Into<Arc<Query>>, opts: QueryOpts) -> Vec<Event> {
        self.stream(query, opts).collect()
    }

    /// Runs a query to completion and returns its nodes, or the error that ended it.
    pub fn nodes(&self, query: impl Into<Arc<Query>>, opts: QueryOpts) -> Result<Vec<Node>> {
        let mut stream = self.stream(query, opts);
        let mut nodes = Vec::new();
        for event in stream.by_ref() {
            if let Event::Node(node) = event {
                nodes.push(node);
            }
        }
        match stream.error() {
            Some(err) => Err(err.clone()),
            None => Ok(nodes),
        }
    }
}

/// Lazy sequence of query events.
///
/// Dropping the stream abandons the query and releases every frame it created.
pub struct EventStream {
    runt: Runt,
    root: Arc<Frame>,
    stage: Option<BoxStage>,
    error: Option<StormError>,
    finished: bool,
    nodes: usize,
}

impl EventStream {
    /// Requests cancellation. The stream ends quietly at its next pull.
    pub fn cancel(&self) {
        self.runt.cancel_token().store(true, Ordering::Relaxed);
    }

    /// The error that ended the stream, if any.
    pub fn error(&self) -> Option<&StormError> {
        self.error.as_ref()
    }

    fn fail(&mut self, err: StormError) {
        debug!(kind = err.code(), error = %err, "storm.query.err");
        self.runt.emit(Event::Err {
            kind: err.code().to_owned(),
            info: err.info(),
        });
        self.error = Some(err);
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.stage = None;
        info!(nodes = self.nodes, "storm.query.fini");
    }
}

impl Iterator for EventStream {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.runt.next_event() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            let Some(stage) = self.stage.as_mut() else {
                self.finish();
                continue;
            };
            match stage.try_next(&self.runt) {
                Ok(Some(node)) => {
                    self.nodes += 1;
                    self.runt.emit(Event::Node(node));
                }
                Ok(None) | Err(Flow::Return(_) | Flow::Break | Flow::Continue) => self.finish(),
                Err(Flow::Error(StormError::Cancelled)) => {
                    self.runt.discard_events();
                    self.finish();
                    debug!("storm.query.cancelled");
                }
                Err(Flow::Error(err)) => self.fail(err),
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.stage = None;
        self.runt.sweep();
        self.root.clear();
    }
}
