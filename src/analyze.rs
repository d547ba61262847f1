//! Runtsafety analysis.
//!
//! An expression is runtsafe when its value does not depend on the node
//! currently travelling through the pipeline. The analyzer finds the variables
//! that can hold node-derived values, then records a flag on every expression
//! so stages can decide whether to evaluate once or per node. `init` and `fini`
//! blocks run without a node and are rejected unless fully runtsafe.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::ast::{Cond, Edit, Expr, ExprKind, FuncDef, Lift, Name, Oper, PivotTarget, Query, TagMatch, TagPart};
use crate::error::{Result, StormError};

type VarSet = FxHashSet<String>;

/// Analyzes `query` once; later calls return the cached outcome.
pub(crate) fn analyze(query: &Query) -> Result<()> {
    query
        .analysis
        .get_or_init(|| {
            let mut unsafe_vars = VarSet::default();
            settle(query, &mut unsafe_vars);
            mark(query, &unsafe_vars);
            let outcome = check_blocks(query);
            debug!(
                opers = query.opers.len(),
                unsafe_vars = unsafe_vars.len(),
                ok = outcome.is_ok(),
                "storm.analyze"
            );
            outcome
        })
        .clone()
}

/// Whether a lift can run once, before any node arrives.
pub(crate) fn lift_runtsafe(lift: &Lift) -> bool {
    match lift {
        Lift::Form { .. } => true,
        Lift::Prop { cmp, .. } => cmp.as_ref().map_or(true, |cmp| cmp.value.is_runtsafe()),
        Lift::Array { cmp, .. } => cmp.value.is_runtsafe(),
        Lift::Tag { tag, cmp, .. } => {
            tag.is_runtsafe() && cmp.as_ref().map_or(true, |cmp| cmp.value.is_runtsafe())
        }
    }
}

/// Grows the unsafe set until no assignment adds to it.
fn settle(query: &Query, unsafe_vars: &mut VarSet) {
    loop {
        let before = unsafe_vars.len();
        collect(query, false, unsafe_vars);
        if unsafe_vars.len() == before {
            return;
        }
    }
}

fn collect(query: &Query, per_node: bool, unsafe_vars: &mut VarSet) {
    for oper in &query.opers {
        match oper {
            Oper::SetVar(set) => {
                if per_node || !expr_safe(&set.value, unsafe_vars) {
                    unsafe_vars.extend(set.names.iter().cloned());
                }
            }
            Oper::For(each) => {
                let tainted = per_node || !expr_safe(&each.iter, unsafe_vars);
                if tainted {
                    unsafe_vars.extend(each.vars.iter().cloned());
                }
                collect(&each.body, tainted, unsafe_vars);
            }
            Oper::If(branch) => {
                let tainted = per_node
                    || branch
                        .clauses
                        .iter()
                        .any(|(cond, _)| !expr_safe(cond, unsafe_vars));
                for (_, body) in &branch.clauses {
                    collect(body, tainted, unsafe_vars);
                }
                if let Some(body) = &branch.default {
                    collect(body, tainted, unsafe_vars);
                }
            }
            Oper::SubQuery(sub) => collect(&sub.query, true, unsafe_vars),
            Oper::Init(block) | Oper::Fini(block) => collect(block, per_node, unsafe_vars),
            _ => {}
        }
    }
}

fn expr_safe(expr: &Expr, unsafe_vars: &VarSet) -> bool {
    match &expr.kind {
        ExprKind::Const(_) => true,
        ExprKind::List(items) => items.iter().all(|item| expr_safe(item, unsafe_vars)),
        ExprKind::Dict(items) => items
            .iter()
            .all(|(key, valu)| expr_safe(key, unsafe_vars) && expr_safe(valu, unsafe_vars)),
        ExprKind::Var(name) => !unsafe_vars.contains(name),
        ExprKind::Node | ExprKind::RelProp(_) | ExprKind::UnivProp(_) | ExprKind::TagValue(_) => false,
        ExprKind::Deref { base, key } => {
            expr_safe(base, unsafe_vars) && name_safe(key, unsafe_vars)
        }
        ExprKind::Call { func, args, kwargs } => {
            expr_safe(func, unsafe_vars)
                && args.iter().all(|arg| expr_safe(arg, unsafe_vars))
                && kwargs.iter().all(|(_, valu)| expr_safe(valu, unsafe_vars))
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            expr_safe(lhs, unsafe_vars) && expr_safe(rhs, unsafe_vars)
        }
        ExprKind::Not(inner) => expr_safe(inner, unsafe_vars),
    }
}

fn name_safe(name: &Name, unsafe_vars: &VarSet) -> bool {
    match name {
        Name::Static(_) => true,
        Name::Dynamic(expr) => expr_safe(expr, unsafe_vars),
    }
}

/// Records the runtsafety flag on every expression of `query`.
fn mark(query: &Query, unsafe_vars: &VarSet) {
    for oper in &query.opers {
        oper_exprs(oper, &mut |expr| mark_expr(expr, unsafe_vars));
        if let Oper::Function(def) = oper {
            mark_function(def);
        }
        for inner in oper_queries(oper) {
            mark(inner, unsafe_vars);
        }
    }
}

/// Function bodies are judged against their own call frame. Each call runs
/// the body once without a node, so parameters and captured names hold one
/// value for the whole call; only the body's own node-derived assignments
/// taint.
fn mark_function(def: &FuncDef) {
    let mut unsafe_vars = VarSet::default();
    settle(&def.body, &mut unsafe_vars);
    mark(&def.body, &unsafe_vars);
}

fn mark_expr(expr: &Expr, unsafe_vars: &VarSet) {
    let _ = expr.safe.set(expr_safe(expr, unsafe_vars));
    for child in expr_children(expr) {
        mark_expr(child, unsafe_vars);
    }
}

fn expr_children(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    match &expr.kind {
        ExprKind::Const(_) | ExprKind::Var(_) | ExprKind::Node => {}
        ExprKind::List(items) => out.extend(items),
        ExprKind::Dict(items) => {
            for (key, valu) in items {
                out.push(key);
                out.push(valu);
            }
        }
        ExprKind::RelProp(name) | ExprKind::UnivProp(name) => name_exprs(name, &mut out),
        ExprKind::TagValue(tag) => tag_exprs(tag, &mut out),
        ExprKind::Deref { base, key } => {
            out.push(base);
            name_exprs(key, &mut out);
        }
        ExprKind::Call { func, args, kwargs } => {
            out.push(func);
            out.extend(args);
            out.extend(kwargs.iter().map(|(_, valu)| valu));
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            out.push(lhs);
            out.push(rhs);
        }
        ExprKind::Not(inner) => out.push(inner),
    }
    out
}

fn name_exprs<'q>(name: &'q Name, out: &mut Vec<&'q Expr>) {
    if let Name::Dynamic(expr) = name {
        out.push(expr);
    }
}

fn tag_exprs<'q>(tag: &'q TagMatch, out: &mut Vec<&'q Expr>) {
    for part in &tag.parts {
        if let TagPart::Dynamic(expr) = part {
            out.push(expr);
        }
    }
}

/// Every expression an operator evaluates itself, excluding nested queries.
fn oper_exprs<'q>(oper: &'q Oper, visit: &mut dyn FnMut(&'q Expr)) {
    let mut out: Vec<&'q Expr> = Vec::new();
    match oper {
        Oper::Lift(lift) => match lift.as_ref() {
            Lift::Form { .. } => {}
            Lift::Prop { cmp, .. } => out.extend(cmp.as_ref().map(|cmp| &cmp.value)),
            Lift::Array { cmp, .. } => out.push(&cmp.value),
            Lift::Tag { tag, cmp, .. } => {
                tag_exprs(tag, &mut out);
                out.extend(cmp.as_ref().map(|cmp| &cmp.value));
            }
        },
        Oper::Filter(filter) => cond_exprs(&filter.cond, &mut out),
        Oper::Pivot(pivot) => {
            if let Some(src) = &pivot.src {
                name_exprs(&src.name, &mut out);
            }
            if let PivotTarget::Tags(tag) = &pivot.target {
                tag_exprs(tag, &mut out);
            }
        }
        Oper::Edit(block) => edit_exprs(&block.edits, &mut out),
        Oper::SetVar(set) => out.push(&set.value),
        Oper::SetItem(set) => {
            out.push(&set.base);
            name_exprs(&set.key, &mut out);
            out.push(&set.value);
        }
        Oper::Expr(expr) | Oper::Yield(expr) | Oper::Limit(expr) => out.push(expr),
        Oper::For(each) => out.push(&each.iter),
        Oper::If(branch) => out.extend(branch.clauses.iter().map(|(cond, _)| cond)),
        Oper::Return(ret) => out.extend(ret.value.as_ref()),
        Oper::SubQuery(_)
        | Oper::Function(_)
        | Oper::Init(_)
        | Oper::Fini(_)
        | Oper::Break
        | Oper::Continue
        | Oper::Uniq
        | Oper::Spin => {}
    }
    for expr in out {
        visit(expr);
    }
}

fn cond_exprs<'q>(cond: &'q Cond, out: &mut Vec<&'q Expr>) {
    match cond {
        Cond::Form(_) => {}
        Cond::AbsProp { cmp, .. } => out.extend(cmp.as_ref().map(|cmp| &cmp.value)),
        Cond::Prop { prop, cmp } => {
            name_exprs(&prop.name, out);
            out.extend(cmp.as_ref().map(|cmp| &cmp.value));
        }
        Cond::Array { prop, cmp } => {
            name_exprs(&prop.name, out);
            out.push(&cmp.value);
        }
        Cond::Tag { tag, cmp } => {
            tag_exprs(tag, out);
            out.extend(cmp.as_ref().map(|cmp| &cmp.value));
        }
        Cond::Expr(expr) => out.push(expr),
        Cond::Not(inner) => cond_exprs(inner, out),
        Cond::And(conds) | Cond::Or(conds) => {
            for cond in conds {
                cond_exprs(cond, out);
            }
        }
    }
}

fn edit_exprs<'q>(edits: &'q [Edit], out: &mut Vec<&'q Expr>) {
    for edit in edits {
        match edit {
            Edit::NodeAdd(add) => out.push(&add.value),
            Edit::PropSet(set) => {
                name_exprs(&set.prop.name, out);
                out.push(&set.value);
            }
            Edit::PropDel(prop) => name_exprs(&prop.name, out),
            Edit::TagAdd(add) => {
                tag_exprs(&add.tag, out);
                out.extend(add.ival.as_ref());
            }
            Edit::TagDel(tag) => tag_exprs(tag, out),
            Edit::TagPropSet(set) => {
                tag_exprs(&set.tag, out);
                out.push(&set.value);
            }
            Edit::TagPropDel(del) => tag_exprs(&del.tag, out),
            Edit::Parens(parens) => {
                out.push(&parens.add.value);
                edit_exprs(&parens.edits, out);
            }
        }
    }
}

/// Nested blocks that run as part of the operator, excluding function bodies.
fn oper_queries(oper: &Oper) -> Vec<&Query> {
    match oper {
        Oper::SubQuery(sub) => vec![sub.query.as_ref()],
        Oper::Init(block) | Oper::Fini(block) => vec![block.as_ref()],
        Oper::For(each) => vec![each.body.as_ref()],
        Oper::If(branch) => branch
            .clauses
            .iter()
            .map(|(_, body)| body.as_ref())
            .chain(branch.default.as_deref())
            .collect(),
        _ => Vec::new(),
    }
}

fn check_blocks(query: &Query) -> Result<()> {
    for oper in &query.opers {
        match oper {
            Oper::Init(block) if !block_safe(block) => {
                return Err(StormError::runtime("Init block query must be runtsafe"));
            }
            Oper::Fini(block) if !block_safe(block) => {
                return Err(StormError::runtime("Fini block query must be runtsafe"));
            }
            Oper::Function(def) => check_blocks(&def.body)?,
            _ => {}
        }
        for inner in oper_queries(oper) {
            check_blocks(inner)?;
        }
    }
    Ok(())
}

fn block_safe(query: &Query) -> bool {
    query.opers.iter().all(|oper| {
        let mut safe = true;
        oper_exprs(oper, &mut |expr| safe &= expr.is_runtsafe());
        if let Oper::Filter(filter) = oper {
            safe &= cond_safe(&filter.cond);
        }
        safe && oper_queries(oper).into_iter().all(block_safe)
    })
}

/// Conditions that inspect the bound node cannot run without one.
fn cond_safe(cond: &Cond) -> bool {
    match cond {
        Cond::Form(_) | Cond::Expr(_) => true,
        Cond::AbsProp { .. } | Cond::Prop { .. } | Cond::Array { .. } | Cond::Tag { .. } => false,
        Cond::Not(inner) => cond_safe(inner),
        Cond::And(conds) | Cond::Or(conds) => conds.iter().all(cond_safe),
    }
}
