//! Pull-based pipeline stages.
//!
//! Every operator becomes a [`Stage`] wrapping its upstream. The consumer pulls
//! the last stage; each pull travels upstream until a node is available, so no
//! stage ever holds more than the node it is working on plus whatever a
//! per-node sub-pipeline is still yielding.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use super::control::{
    BreakProducer, ExprProducer, ForProducer, IfProducer, ReturnProducer, SetItemProducer,
    SetVarProducer, YieldProducer,
};
use super::edit::build_edits;
use super::eval::{eval, eval_cond, resolve_tag, Cx};
use super::pivot::build_pivot;
use super::runt::Runt;
use super::scope::{Frame, ScopeGuard};
use crate::analyze;
use crate::ast::{Lift, Oper, Query, SubQuery};
use crate::error::{Result, StormError};
use crate::node::Node;
use crate::profile::{profile_timer, record_profile_timer, StageKind};
use crate::spooled::SpooledSet;
use crate::storage::NodeIter;
use crate::value::{Closure, Function, Value};

/// Non-local exits travelling through the pipeline alongside errors.
pub(crate) enum Flow {
    Error(StormError),
    Return(Value),
    Break,
    Continue,
}

impl From<StormError> for Flow {
    fn from(err: StormError) -> Self {
        Flow::Error(err)
    }
}

pub(crate) type Pull = std::result::Result<Option<Node>, Flow>;

/// One pull-based pipeline stage.
pub(crate) trait Stage: Send {
    fn try_next(&mut self, runt: &Runt) -> Pull;
}

pub(crate) type BoxStage = Box<dyn Stage>;

/// Emits a fixed list of nodes.
pub(crate) struct Seed {
    nodes: VecDeque<Node>,
}

impl Seed {
    pub(crate) fn new(nodes: impl IntoIterator<Item = Node>) -> BoxStage {
        Box::new(Seed {
            nodes: nodes.into_iter().collect(),
        })
    }

    pub(crate) fn empty() -> BoxStage {
        Seed::new(None)
    }
}

impl Stage for Seed {
    fn try_next(&mut self, _runt: &Runt) -> Pull {
        Ok(self.nodes.pop_front())
    }
}

/// Wraps a storage iterator.
pub(crate) struct NodeSource {
    iter: NodeIter,
    kind: StageKind,
}

impl NodeSource {
    pub(crate) fn new(iter: NodeIter, kind: StageKind) -> BoxStage {
        Box::new(NodeSource { iter, kind })
    }
}

impl Stage for NodeSource {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        runt.check()?;
        let timer = profile_timer();
        let item = self.iter.next().transpose()?;
        record_profile_timer(self.kind, timer);
        Ok(item)
    }
}

/// Concatenates stages.
pub(crate) struct Chain {
    parts: VecDeque<BoxStage>,
}

impl Chain {
    pub(crate) fn new(parts: Vec<BoxStage>) -> BoxStage {
        Box::new(Chain {
            parts: parts.into(),
        })
    }
}

impl Stage for Chain {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        while let Some(part) = self.parts.front_mut() {
            if let Some(node) = part.try_next(runt)? {
                return Ok(Some(node));
            }
            self.parts.pop_front();
        }
        Ok(None)
    }
}

/// When a [`Producer`] runs relative to inbound nodes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Node sources: inbound nodes pass through; run once after exhaustion when
    /// runtsafe, otherwise once per inbound node.
    Produce,
    /// Statements: run per inbound node, and once after exhaustion when
    /// runtsafe and no node arrived.
    Each,
}

/// Operator body driven by [`Driven`]. `node` is `None` for the run that
/// happens after upstream exhaustion.
pub(crate) trait Producer: Send {
    fn produce(
        &mut self,
        runt: &Runt,
        node: Option<&Node>,
    ) -> std::result::Result<Option<BoxStage>, Flow>;
}

pub(crate) struct Driven<P> {
    upstream: BoxStage,
    producer: P,
    trigger: Trigger,
    runtsafe: bool,
    passthrough: bool,
    extra: Option<BoxStage>,
    seen: bool,
    done: bool,
}

impl<P: Producer + 'static> Driven<P> {
    /// `passthrough` yields each inbound node before the producer's output;
    /// otherwise the output replaces it.
    pub(crate) fn new(
        upstream: BoxStage,
        producer: P,
        trigger: Trigger,
        runtsafe: bool,
        passthrough: bool,
    ) -> BoxStage {
        Box::new(Driven {
            upstream,
            producer,
            trigger,
            runtsafe,
            passthrough,
            extra: None,
            seen: false,
            done: false,
        })
    }
}

impl<P: Producer> Stage for Driven<P> {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        loop {
            if let Some(extra) = self.extra.as_mut() {
                if let Some(node) = extra.try_next(runt)? {
                    return Ok(Some(node));
                }
                self.extra = None;
            }
            if self.done {
                return Ok(None);
            }
            runt.check()?;
            match self.upstream.try_next(runt)? {
                Some(node) => {
                    self.seen = true;
                    let per_node = match self.trigger {
                        Trigger::Produce => !self.runtsafe,
                        Trigger::Each => true,
                    };
                    if !per_node {
                        return Ok(Some(node));
                    }
                    self.extra = self.producer.produce(runt, Some(&node))?;
                    if self.passthrough {
                        return Ok(Some(node));
                    }
                }
                None => {
                    self.done = true;
                    let once = match self.trigger {
                        Trigger::Produce => self.runtsafe,
                        Trigger::Each => self.runtsafe && !self.seen,
                    };
                    if once {
                        self.extra = self.producer.produce(runt, None)?;
                    }
                }
            }
        }
    }
}

/// Builds the stage chain for `query` over `input`, hoisting its function
/// definitions into `frame` first.
pub(crate) fn build_query(
    query: &Arc<Query>,
    frame: &Arc<Frame>,
    input: BoxStage,
    runt: &Runt,
) -> BoxStage {
    for oper in &query.opers {
        if let Oper::Function(def) = oper {
            let closure = Closure {
                def: Arc::clone(def),
                frame: Arc::clone(frame),
            };
            frame.define(&def.name, Value::Func(Function::Closure(Arc::new(closure))));
            runt.capture(frame);
        }
    }
    let mut stage = input;
    for oper in &query.opers {
        stage = build_oper(oper, frame, stage, runt);
    }
    stage
}

fn build_oper(oper: &Oper, frame: &Arc<Frame>, upstream: BoxStage, runt: &Runt) -> BoxStage {
    let frame = Arc::clone(frame);
    match oper {
        Oper::Lift(lift) => {
            let runtsafe = analyze::lift_runtsafe(lift);
            let producer = LiftProducer {
                lift: Arc::clone(lift),
                frame,
            };
            Driven::new(upstream, producer, Trigger::Produce, runtsafe, true)
        }
        Oper::Filter(filter) => Box::new(FilterStage {
            upstream,
            filter: Arc::clone(filter),
            frame,
        }),
        Oper::Pivot(pivot) => build_pivot(upstream, Arc::clone(pivot), frame),
        Oper::SubQuery(sub) => Box::new(SubQueryStage {
            upstream,
            sub: Arc::clone(sub),
            frame,
            inner: None,
            pending: None,
        }),
        Oper::Edit(block) => build_edits(upstream, &block.edits, &frame),
        Oper::SetVar(set) => {
            let runtsafe = set.value.is_runtsafe();
            let producer = SetVarProducer::new(Arc::clone(set), frame);
            Driven::new(upstream, producer, Trigger::Each, runtsafe, true)
        }
        Oper::SetItem(set) => {
            let runtsafe =
                set.base.is_runtsafe() && set.key.is_runtsafe() && set.value.is_runtsafe();
            let producer = SetItemProducer::new(Arc::clone(set), frame);
            Driven::new(upstream, producer, Trigger::Each, runtsafe, true)
        }
        Oper::Expr(expr) => {
            let runtsafe = expr.is_runtsafe();
            let producer = ExprProducer::new(Arc::clone(expr), frame);
            Driven::new(upstream, producer, Trigger::Each, runtsafe, true)
        }
        Oper::Function(_) => upstream,
        Oper::Init(block) => Box::new(InitStage {
            upstream,
            block: Arc::clone(block),
            frame,
            state: InitState::Pending,
        }),
        Oper::Fini(block) => Box::new(FiniStage {
            upstream,
            block: Arc::clone(block),
            frame,
            fini: None,
            done: false,
        }),
        Oper::For(each) => {
            let runtsafe = each.iter.is_runtsafe();
            let producer = ForProducer::new(Arc::clone(each), frame);
            Driven::new(upstream, producer, Trigger::Each, runtsafe, false)
        }
        Oper::If(branch) => {
            let runtsafe = branch.clauses.iter().all(|(cond, _)| cond.is_runtsafe());
            let producer = IfProducer::new(Arc::clone(branch), frame);
            Driven::new(upstream, producer, Trigger::Each, runtsafe, false)
        }
        Oper::Return(ret) => {
            let runtsafe = ret.value.as_ref().map_or(true, |value| value.is_runtsafe());
            let producer = ReturnProducer::new(Arc::clone(ret), frame);
            Driven::new(upstream, producer, Trigger::Each, runtsafe, true)
        }
        Oper::Break => Driven::new(upstream, BreakProducer::Break, Trigger::Each, true, true),
        Oper::Continue => {
            Driven::new(upstream, BreakProducer::Continue, Trigger::Each, true, true)
        }
        Oper::Yield(expr) => {
            let runtsafe = expr.is_runtsafe();
            let producer = YieldProducer::new(Arc::clone(expr), frame);
            Driven::new(upstream, producer, Trigger::Each, runtsafe, true)
        }
        Oper::Uniq => Box::new(UniqStage {
            upstream,
            seen: SpooledSet::with_options(&runt.opts),
        }),
        Oper::Limit(count) => Box::new(LimitStage {
            upstream,
            count: Arc::clone(count),
            frame,
            left: None,
        }),
        Oper::Spin => Box::new(SpinStage { upstream }),
    }
}

/// Drains a stage, discarding nodes. Returns the control flow that ended it.
pub(crate) fn drain(stage: &mut BoxStage, runt: &Runt) -> std::result::Result<(), Flow> {
    while stage.try_next(runt)?.is_some() {}
    Ok(())
}

struct LiftProducer {
    lift: Arc<Lift>,
    frame: Arc<Frame>,
}

impl Producer for LiftProducer {
    fn produce(
        &mut self,
        runt: &Runt,
        node: Option<&Node>,
    ) -> std::result::Result<Option<BoxStage>, Flow> {
        let cx = Cx::new(runt, &self.frame, node);
        let iter = match self.lift.as_ref() {
            Lift::Form { form } => runt.store.lift_form(form)?,
            Lift::Prop { prop, cmp } => match cmp {
                Some(cmp) => {
                    let valu = eval(&cmp.value, &cx)?.to_prim()?;
                    runt.store.lift_prop(prop, Some((&cmp.cmpr, &valu)))?
                }
                None => runt.store.lift_prop(prop, None)?,
            },
            Lift::Array { prop, cmp } => {
                let valu = eval(&cmp.value, &cx)?.to_prim()?;
                runt.store.lift_prop_array(prop, &cmp.cmpr, &valu)?
            }
            Lift::Tag { tag, form, cmp } => {
                let tag = resolve_tag(tag, &cx)?;
                match cmp {
                    Some(cmp) => {
                        let valu = eval(&cmp.value, &cx)?.to_prim()?;
                        runt.store
                            .lift_tag(&tag, form.as_deref(), Some((&cmp.cmpr, &valu)))?
                    }
                    None => runt.store.lift_tag(&tag, form.as_deref(), None)?,
                }
            }
        };
        trace!(lift = ?self.lift, "storm.stage.lift");
        Ok(Some(NodeSource::new(iter, StageKind::Lift)))
    }
}

struct FilterStage {
    upstream: BoxStage,
    filter: Arc<crate::ast::Filter>,
    frame: Arc<Frame>,
}

impl Stage for FilterStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        while let Some(node) = self.upstream.try_next(runt)? {
            runt.check()?;
            let timer = profile_timer();
            let cx = Cx::new(runt, &self.frame, Some(&node));
            let hit = eval_cond(&self.filter.cond, &cx)?;
            record_profile_timer(StageKind::Filter, timer);
            if hit == self.filter.keep {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }
}

struct SubQueryStage {
    upstream: BoxStage,
    sub: Arc<SubQuery>,
    frame: Arc<Frame>,
    inner: Option<(BoxStage, ScopeGuard)>,
    pending: Option<Node>,
}

impl Stage for SubQueryStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        loop {
            if let Some((inner, _)) = self.inner.as_mut() {
                match inner.try_next(runt)? {
                    Some(node) if self.sub.yields => return Ok(Some(node)),
                    Some(_) => continue,
                    None => {
                        self.inner = None;
                        if let Some(node) = self.pending.take() {
                            return Ok(Some(node));
                        }
                    }
                }
            }
            let Some(node) = self.upstream.try_next(runt)? else {
                return Ok(None);
            };
            let child = Frame::child(&self.frame);
            let inner = build_query(
                &self.sub.query,
                &child,
                Seed::new([node.clone()]),
                runt,
            );
            self.inner = Some((inner, ScopeGuard::new(child)));
            self.pending = Some(node);
        }
    }
}

enum InitState {
    Pending,
    Emitting { init: BoxStage, held: Option<Node> },
    Passing,
    Done,
}

/// Runs its block in the enclosing frame as soon as the first upstream item, or
/// upstream exhaustion, is observed. Block nodes precede the held item.
struct InitStage {
    upstream: BoxStage,
    block: Arc<Query>,
    frame: Arc<Frame>,
    state: InitState,
}

impl Stage for InitStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        loop {
            match &mut self.state {
                InitState::Pending => {
                    let held = self.upstream.try_next(runt)?;
                    let init = build_query(&self.block, &self.frame, Seed::empty(), runt);
                    self.state = InitState::Emitting { init, held };
                }
                InitState::Emitting { init, held } => {
                    if let Some(node) = init.try_next(runt)? {
                        return Ok(Some(node));
                    }
                    match held.take() {
                        Some(node) => {
                            self.state = InitState::Passing;
                            return Ok(Some(node));
                        }
                        None => {
                            self.state = InitState::Done;
                        }
                    }
                }
                InitState::Passing => return self.upstream.try_next(runt),
                InitState::Done => return Ok(None),
            }
        }
    }
}

/// Runs its block in the enclosing frame after upstream exhaustion.
struct FiniStage {
    upstream: BoxStage,
    block: Arc<Query>,
    frame: Arc<Frame>,
    fini: Option<BoxStage>,
    done: bool,
}

impl Stage for FiniStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        if let Some(fini) = self.fini.as_mut() {
            return fini.try_next(runt);
        }
        if self.done {
            return Ok(None);
        }
        if let Some(node) = self.upstream.try_next(runt)? {
            return Ok(Some(node));
        }
        self.done = true;
        let mut fini = build_query(&self.block, &self.frame, Seed::empty(), runt);
        let first = fini.try_next(runt)?;
        self.fini = Some(fini);
        Ok(first)
    }
}

struct UniqStage {
    upstream: BoxStage,
    seen: SpooledSet,
}

impl Stage for UniqStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        while let Some(node) = self.upstream.try_next(runt)? {
            if self.seen.add(node.ndef_prim())? {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }
}

struct LimitStage {
    upstream: BoxStage,
    count: Arc<crate::ast::Expr>,
    frame: Arc<Frame>,
    left: Option<usize>,
}

impl Stage for LimitStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        let left = match self.left {
            Some(left) => left,
            None => {
                let cx = Cx::new(runt, &self.frame, None);
                let count = eval(&self.count, &cx)?.to_prim()?;
                let Some(count) = count.as_int() else {
                    return Err(StormError::bad_valu("int", count, "limit requires an integer").into());
                };
                let count = usize::try_from(count).unwrap_or(0);
                self.left = Some(count);
                count
            }
        };
        if left == 0 {
            return Ok(None);
        }
        let item = self.upstream.try_next(runt)?;
        if item.is_some() {
            self.left = Some(left - 1);
        }
        Ok(item)
    }
}

struct SpinStage {
    upstream: BoxStage,
}

impl Stage for SpinStage {
    fn try_next(&mut self, runt: &Runt) -> Pull {
        while self.upstream.try_next(runt)?.is_some() {
            runt.check()?;
        }
        Ok(None)
    }
}

/// Result of a value-context run: the `return` value, or null on completion.
pub(crate) fn run_for_value(stage: &mut BoxStage, runt: &Runt) -> Result<Value> {
    match drain(stage, runt) {
        Ok(()) | Err(Flow::Break) | Err(Flow::Continue) => Ok(Value::Null),
        Err(Flow::Return(valu)) => Ok(valu),
        Err(Flow::Error(err)) => Err(err),
    }
}
