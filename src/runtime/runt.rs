//! Per-query runtime state shared by every stage of one pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tracing::debug;

use super::auth::Authorizer;
use super::scope::Frame;
use super::Event;
use crate::ast::Query;
use crate::config::RuntimeOptions;
use crate::error::{Info, Result, StormError};
use crate::model::Model;
use crate::storage::{Deprecation, Storage};

pub(crate) struct Runt {
    pub(crate) store: Arc<dyn Storage>,
    pub(crate) model: Arc<Model>,
    pub(crate) opts: Arc<RuntimeOptions>,
    user: Option<String>,
    auth: Option<Arc<dyn Authorizer>>,
    modules: Arc<FxHashMap<String, Arc<Query>>>,
    events: Mutex<VecDeque<Event>>,
    warned: Mutex<FxHashSet<String>>,
    captured: Mutex<Vec<Weak<Frame>>>,
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
    depth: AtomicUsize,
}

pub(crate) struct RuntParts {
    pub(crate) store: Arc<dyn Storage>,
    pub(crate) opts: Arc<RuntimeOptions>,
    pub(crate) user: Option<String>,
    pub(crate) auth: Option<Arc<dyn Authorizer>>,
    pub(crate) modules: Arc<FxHashMap<String, Arc<Query>>>,
    pub(crate) cancel: Arc<AtomicBool>,
}

impl Runt {
    pub(crate) fn new(parts: RuntParts) -> Self {
        let deadline = parts.opts.timeout().map(|limit| Instant::now() + limit);
        Self {
            model: parts.store.model(),
            store: parts.store,
            opts: parts.opts,
            user: parts.user,
            auth: parts.auth,
            modules: parts.modules,
            events: Mutex::new(VecDeque::new()),
            warned: Mutex::new(FxHashSet::default()),
            captured: Mutex::new(Vec::new()),
            cancel: parts.cancel,
            deadline,
            depth: AtomicUsize::new(0),
        }
    }

    /// Fails with `Cancelled` once the consumer cancelled or the deadline passed.
    pub(crate) fn check(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(StormError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.cancel.store(true, Ordering::Relaxed);
            return Err(StormError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn cancel_token(&self) -> &Arc<AtomicBool> {
        &self.cancel
    }

    pub(crate) fn emit(&self, event: Event) {
        self.events.lock().push_back(event);
    }

    pub(crate) fn next_event(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }

    pub(crate) fn discard_events(&self) {
        self.events.lock().clear();
    }

    /// Emits a warning unless the same message was already sent by this query.
    pub(crate) fn warn_once(&self, mesg: String, info: Info) {
        if self.warned.lock().insert(mesg.clone()) {
            self.emit(Event::Warn { mesg, info });
        }
    }

    /// Forwards deprecations collected by a storage edit.
    pub(crate) fn forward(&self, warns: Vec<Deprecation>) {
        for warn in warns {
            let mut info = Info::new();
            info.insert("name".into(), json!(warn.name));
            self.warn_once(warn.mesg, info);
        }
    }

    /// Consults the authorizer when both a user and an authorizer are present.
    pub(crate) fn confirm(&self, perm: &[&str]) -> Result<()> {
        let (Some(user), Some(auth)) = (&self.user, &self.auth) else {
            return Ok(());
        };
        if auth.allowed(user, perm) {
            return Ok(());
        }
        Err(StormError::AuthDeny {
            user: user.clone(),
            perm: perm.join("."),
        })
    }

    pub(crate) fn module(&self, name: &str) -> Option<Arc<Query>> {
        self.modules.get(name).cloned()
    }

    /// Tracks call nesting; the guard undoes the increment.
    pub(crate) fn enter_call(&self, name: &str) -> Result<DepthGuard<'_>> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        let guard = DepthGuard { depth: &self.depth };
        if depth > self.opts.max_call_depth {
            return Err(StormError::runtime(format!(
                "Maximum call depth of {} exceeded calling {name}",
                self.opts.max_call_depth
            ))
            .with("name", name)
            .with("depth", self.opts.max_call_depth));
        }
        Ok(guard)
    }

    /// Remembers a frame a closure or module holds on to. Each live frame is
    /// tracked once; frames already dropped are forgotten.
    pub(crate) fn capture(&self, frame: &Arc<Frame>) {
        frame.mark_captured();
        let mut captured = self.captured.lock();
        captured.retain(|held| held.strong_count() > 0);
        if !captured
            .iter()
            .any(|held| std::ptr::eq(held.as_ptr(), Arc::as_ptr(frame)))
        {
            captured.push(Arc::downgrade(frame));
        }
    }

    /// Clears every captured frame still alive.
    pub(crate) fn sweep(&self) {
        let frames: Vec<Weak<Frame>> = std::mem::take(&mut *self.captured.lock());
        let mut cleared = 0usize;
        for frame in frames.iter().filter_map(Weak::upgrade) {
            frame.clear();
            cleared += 1;
        }
        if cleared > 0 {
            debug!(frames = cleared, "storm.query.sweep");
        }
    }
}

pub(crate) struct DepthGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn runt() -> Runt {
        Runt::new(RuntParts {
            store: Arc::new(MemoryStore::new(Model::new())),
            opts: Arc::new(RuntimeOptions::default()),
            user: None,
            auth: None,
            modules: Arc::new(FxHashMap::default()),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    #[test]
    fn captured_frames_are_tracked_once() {
        let runt = runt();
        let frame = Frame::root();
        for _ in 0..8 {
            runt.capture(&frame);
        }
        assert_eq!(runt.captured.lock().len(), 1);

        let short = Frame::root();
        runt.capture(&short);
        assert_eq!(runt.captured.lock().len(), 2);
        drop(short);
        runt.capture(&frame);
        assert_eq!(runt.captured.lock().len(), 1);
    }
}
