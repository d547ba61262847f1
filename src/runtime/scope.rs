//! Variable frames.
//!
//! Frames form a parent chain. Reads walk outward until a binding is found.
//! Writes land on the nearest frame that already binds the name, so a
//! subquery assigning an outer variable updates it in place. An unbound name is
//! defined on the nearest isolated frame (the query root or a function call),
//! which makes variables first assigned inside a subquery readable by the rest
//! of the pipeline. Writes never walk past an isolated frame, while reads still
//! reach a closure's captured chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::value::{Library, Value};

/// One level of variable bindings.
pub(crate) struct Frame {
    vars: Mutex<FxHashMap<String, Value>>,
    parent: Option<Arc<Frame>>,
    isolated: bool,
    captured: AtomicBool,
}

impl Frame {
    /// Top-level frame with `$lib` bound.
    pub(crate) fn root() -> Arc<Frame> {
        let frame = Frame::with_parent(None, true);
        frame.define("lib", Value::Lib(Library::Root));
        frame
    }

    /// Block frame whose writes may smash outer bindings.
    pub(crate) fn child(parent: &Arc<Frame>) -> Arc<Frame> {
        Frame::with_parent(Some(Arc::clone(parent)), false)
    }

    /// Function call frame parented to a closure's captured chain.
    pub(crate) fn call(parent: &Arc<Frame>) -> Arc<Frame> {
        Frame::with_parent(Some(Arc::clone(parent)), true)
    }

    fn with_parent(parent: Option<Arc<Frame>>, isolated: bool) -> Arc<Frame> {
        Arc::new(Frame {
            vars: Mutex::new(FxHashMap::default()),
            parent,
            isolated,
            captured: AtomicBool::new(false),
        })
    }

    /// Resolves `name` outward through the chain.
    pub(crate) fn get(&self, name: &str) -> Option<Value> {
        let mut cursor = Some(self);
        while let Some(frame) = cursor {
            if let Some(valu) = frame.vars.lock().get(name) {
                return Some(valu.clone());
            }
            cursor = frame.parent.as_deref();
        }
        None
    }

    /// Assigns to the nearest binding of `name`, or defines it on the nearest
    /// isolated frame.
    pub(crate) fn set(&self, name: &str, valu: Value) {
        let mut frame = self;
        loop {
            if let Some(slot) = frame.vars.lock().get_mut(name) {
                *slot = valu;
                return;
            }
            match frame.parent.as_deref() {
                Some(parent) if !frame.isolated => frame = parent,
                _ => break,
            }
        }
        frame.define(name, valu);
    }

    /// Binds `name` in this frame, shadowing any outer binding.
    pub(crate) fn define(&self, name: &str, valu: Value) {
        self.vars.lock().insert(name.to_owned(), valu);
    }

    /// Whether this frame itself binds `name`.
    #[cfg(test)]
    pub(crate) fn has_local(&self, name: &str) -> bool {
        self.vars.lock().contains_key(name)
    }

    /// Marks this frame and its ancestors as referenced by a closure or module.
    pub(crate) fn mark_captured(&self) {
        let mut cursor = Some(self);
        while let Some(frame) = cursor {
            if frame.captured.swap(true, Ordering::AcqRel) {
                return;
            }
            cursor = frame.parent.as_deref();
        }
    }

    pub(crate) fn is_captured(&self) -> bool {
        self.captured.load(Ordering::Acquire)
    }

    /// Drops every binding. Breaks reference cycles between frames and the
    /// closures stored in them.
    pub(crate) fn clear(&self) {
        let drained: Vec<Value> = self.vars.lock().drain().map(|(_, valu)| valu).collect();
        drop(drained);
    }
}

/// Releases a block frame when the block finishes or is abandoned.
pub(crate) struct ScopeGuard {
    frame: Arc<Frame>,
}

impl ScopeGuard {
    pub(crate) fn new(frame: Arc<Frame>) -> Self {
        Self { frame }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.frame.is_captured() {
            self.frame.clear();
        }
    }
}
