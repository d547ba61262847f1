//! Opt-in stage timing counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Per-stage timing totals for the pipeline engine.
///
/// Profiling is enabled by setting the `STORM_PROFILE` environment variable
/// before the first query runs. Counters are process wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageProfileSnapshot {
    /// Total nanoseconds spent pulling nodes from storage lifts.
    pub lift_ns: u64,
    /// Number of lifted nodes.
    pub lift_count: u64,
    /// Total nanoseconds spent evaluating filter conditions.
    pub filter_ns: u64,
    /// Number of filter evaluations.
    pub filter_count: u64,
    /// Total nanoseconds spent resolving pivots.
    pub pivot_ns: u64,
    /// Number of pivoted source nodes.
    pub pivot_count: u64,
    /// Total nanoseconds spent applying edits.
    pub edit_ns: u64,
    /// Number of applied edit operators.
    pub edit_count: u64,
    /// Total nanoseconds spent in storm function calls.
    pub call_ns: u64,
    /// Number of storm function calls.
    pub call_count: u64,
}

#[derive(Default)]
struct StageProfileCounters {
    lift_ns: AtomicU64,
    lift_count: AtomicU64,
    filter_ns: AtomicU64,
    filter_count: AtomicU64,
    pivot_ns: AtomicU64,
    pivot_count: AtomicU64,
    edit_ns: AtomicU64,
    edit_count: AtomicU64,
    call_ns: AtomicU64,
    call_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<StageProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("STORM_PROFILE").is_some())
}

fn counters() -> Option<&'static StageProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(StageProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

#[derive(Clone, Copy)]
pub(crate) enum StageKind {
    Lift,
    Filter,
    Pivot,
    Edit,
    Call,
}

pub(crate) fn record_profile_timer(kind: StageKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        StageKind::Lift => (&counters.lift_ns, &counters.lift_count),
        StageKind::Filter => (&counters.filter_ns, &counters.filter_count),
        StageKind::Pivot => (&counters.pivot_ns, &counters.pivot_count),
        StageKind::Edit => (&counters.edit_ns, &counters.edit_count),
        StageKind::Call => (&counters.call_ns, &counters.call_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Reads the stage counters, optionally resetting them.
///
/// Returns `None` when `STORM_PROFILE` is unset.
pub fn stage_profile_snapshot(reset: bool) -> Option<StageProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(StageProfileSnapshot {
        lift_ns: load(&counters.lift_ns),
        lift_count: load(&counters.lift_count),
        filter_ns: load(&counters.filter_ns),
        filter_count: load(&counters.filter_count),
        pivot_ns: load(&counters.pivot_ns),
        pivot_count: load(&counters.pivot_count),
        edit_ns: load(&counters.edit_ns),
        edit_count: load(&counters.edit_count),
        call_ns: load(&counters.call_ns),
        call_count: load(&counters.call_count),
    })
}
