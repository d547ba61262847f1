//! Fluent construction of query trees.

use std::mem;
use std::sync::Arc;

use crate::ast::{
    BinOp, Cmp, Cond, Edit, EditBlock, EditParens, Expr, ExprKind, Filter, ForLoop, FuncDef,
    IfElse, Lift, Name, NodeAdd, Oper, Pivot, PivotDir, PivotTarget, PropRef, PropSet, Query,
    Return, SetItem, SetVar, SubQuery, TagAdd, TagMatch, TagPropDel, TagPropSet,
};
use crate::error::{Result, StormError};
use crate::prim::Prim;

/// Fluent builder for [`Query`] trees.
///
/// Errors (malformed tag or property references) are recorded and reported by
/// [`QueryBuilder::build`]; later calls become no-ops once an error is stored.
#[derive(Default)]
pub struct QueryBuilder {
    opers: Vec<Oper>,
    error: Option<StormError>,
}

impl QueryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, oper: Result<Oper>) -> Self {
        if self.error.is_some() {
            return self;
        }
        match oper {
            Ok(oper) => self.opers.push(oper),
            Err(err) => self.error = Some(err),
        }
        self
    }

    fn nested<F>(&mut self, build: F) -> Option<Arc<Query>>
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        match build(QueryBuilder::new()).build() {
            Ok(query) => Some(Arc::new(query)),
            Err(err) => {
                self.error.get_or_insert(err);
                None
            }
        }
    }

    /// `form`: lift every node of a form.
    pub fn lift_form(self, form: &str) -> Self {
        self.push(Ok(Oper::Lift(Arc::new(Lift::Form { form: form.into() }))))
    }

    /// `prop`: lift nodes that have a property set.
    pub fn lift_has(self, prop: &str) -> Self {
        self.push(Ok(Oper::Lift(Arc::new(Lift::Prop {
            prop: prop.into(),
            cmp: None,
        }))))
    }

    /// `prop cmpr value`: lift by property comparison. Passing the form name
    /// compares the primary value.
    pub fn lift(self, prop: &str, cmpr: &str, value: Expr) -> Self {
        self.push(Ok(Oper::Lift(Arc::new(Lift::Prop {
            prop: prop.into(),
            cmp: Some(cmp(cmpr, value)),
        }))))
    }

    /// `prop*[cmpr value]`: lift by array element comparison.
    pub fn lift_array(self, prop: &str, cmpr: &str, value: Expr) -> Self {
        self.push(Ok(Oper::Lift(Arc::new(Lift::Array {
            prop: prop.into(),
            cmp: cmp(cmpr, value),
        }))))
    }

    /// `#tag`: lift tagged nodes.
    pub fn lift_tag(self, tag: &str) -> Self {
        let oper = TagMatch::parse(tag).map(|tag| {
            Oper::Lift(Arc::new(Lift::Tag {
                tag,
                form: None,
                cmp: None,
            }))
        });
        self.push(oper)
    }

    /// `form#tag cmpr value`: lift tagged nodes of one form by tag interval.
    pub fn lift_tag_cmp(self, form: Option<&str>, tag: &str, cmpr: &str, value: Expr) -> Self {
        let oper = TagMatch::parse(tag).map(|tag| {
            Oper::Lift(Arc::new(Lift::Tag {
                tag,
                form: form.map(str::to_owned),
                cmp: Some(self::cmp(cmpr, value)),
            }))
        });
        self.push(oper)
    }

    /// `+cond`.
    pub fn filter(self, cond: Cond) -> Self {
        self.push(Ok(Oper::Filter(Arc::new(Filter { keep: true, cond }))))
    }

    /// `-cond`.
    pub fn exclude(self, cond: Cond) -> Self {
        self.push(Ok(Oper::Filter(Arc::new(Filter { keep: false, cond }))))
    }

    /// `-> target` where target is `*`, a form, or a `#tag` pattern.
    pub fn pivot_out(self, target: &str) -> Self {
        let oper = pivot_target(target).map(|target| {
            Oper::Pivot(Arc::new(Pivot {
                dir: PivotDir::Out,
                src: None,
                target,
            }))
        });
        self.push(oper)
    }

    /// `<- target` where target is `*` or a form.
    pub fn pivot_in(self, target: &str) -> Self {
        let oper = pivot_target(target).map(|target| {
            Oper::Pivot(Arc::new(Pivot {
                dir: PivotDir::In,
                src: None,
                target,
            }))
        });
        self.push(oper)
    }

    /// `:prop -> target`.
    pub fn prop_pivot(self, prop: &str, target: &str) -> Self {
        let oper = PropRef::parse(prop).and_then(|src| {
            Ok(Oper::Pivot(Arc::new(Pivot {
                dir: PivotDir::Out,
                src: Some(src),
                target: pivot_target(target)?,
            })))
        });
        self.push(oper)
    }

    /// `{ ... }`.
    pub fn subquery<F>(mut self, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        match self.nested(build) {
            Some(query) => self.push(Ok(Oper::SubQuery(Arc::new(SubQuery {
                query,
                yields: false,
            })))),
            None => self,
        }
    }

    /// `yield { ... }`.
    pub fn yield_subquery<F>(mut self, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        match self.nested(build) {
            Some(query) => self.push(Ok(Oper::SubQuery(Arc::new(SubQuery {
                query,
                yields: true,
            })))),
            None => self,
        }
    }

    /// `[ ... ]`.
    pub fn edit<F>(self, build: F) -> Self
    where
        F: FnOnce(&mut EditBuilder),
    {
        let mut edits = EditBuilder::default();
        build(&mut edits);
        let oper = edits
            .finish()
            .map(|edits| Oper::Edit(Arc::new(EditBlock { edits })));
        self.push(oper)
    }

    /// `$name = value`.
    pub fn set_var(self, name: &str, value: Expr) -> Self {
        self.push(Ok(Oper::SetVar(Arc::new(SetVar {
            names: vec![name.into()],
            value,
        }))))
    }

    /// `($a, $b) = value`.
    pub fn set_vars(self, names: &[&str], value: Expr) -> Self {
        self.push(Ok(Oper::SetVar(Arc::new(SetVar {
            names: names.iter().map(|name| (*name).to_owned()).collect(),
            value,
        }))))
    }

    /// `$base.key = value`; a key starting with `$` is read from that variable.
    pub fn set_item(self, base: Expr, key: &str, value: Expr) -> Self {
        self.push(Ok(Oper::SetItem(Arc::new(SetItem {
            base,
            key: Name::parse(key),
            value,
        }))))
    }

    /// Statement expression, usually a call.
    pub fn call(self, expr: Expr) -> Self {
        self.push(Ok(Oper::Expr(Arc::new(expr))))
    }

    /// `function name(params) { body }`.
    pub fn function<F>(mut self, name: &str, params: &[&str], build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        match self.nested(build) {
            Some(body) => self.push(Ok(Oper::Function(Arc::new(FuncDef {
                name: name.into(),
                params: params.iter().map(|p| (*p).to_owned()).collect(),
                body,
            })))),
            None => self,
        }
    }

    /// `init { ... }`.
    pub fn init<F>(mut self, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        match self.nested(build) {
            Some(block) => self.push(Ok(Oper::Init(block))),
            None => self,
        }
    }

    /// `fini { ... }`.
    pub fn fini<F>(mut self, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        match self.nested(build) {
            Some(block) => self.push(Ok(Oper::Fini(block))),
            None => self,
        }
    }

    /// `for $var in iter { body }`; several vars unpack each item.
    pub fn for_each<F>(mut self, vars: &[&str], iter: Expr, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        match self.nested(build) {
            Some(body) => self.push(Ok(Oper::For(Arc::new(ForLoop {
                vars: vars.iter().map(|v| (*v).to_owned()).collect(),
                iter,
                body,
            })))),
            None => self,
        }
    }

    /// `if cond { then } else { otherwise }`. Chain more arms with
    /// [`QueryBuilder::if_chain`].
    pub fn if_else<T, E>(mut self, cond: Expr, then: T, otherwise: Option<E>) -> Self
    where
        T: FnOnce(QueryBuilder) -> QueryBuilder,
        E: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        let Some(body) = self.nested(then) else {
            return self;
        };
        let default = match otherwise {
            Some(build) => match self.nested(build) {
                Some(query) => Some(query),
                None => return self,
            },
            None => None,
        };
        self.push(Ok(Oper::If(Arc::new(IfElse {
            clauses: vec![(cond, body)],
            default,
        }))))
    }

    /// `if` with pre-built `elif` arms.
    pub fn if_chain(self, clauses: Vec<(Expr, Query)>, default: Option<Query>) -> Self {
        self.push(Ok(Oper::If(Arc::new(IfElse {
            clauses: clauses
                .into_iter()
                .map(|(cond, body)| (cond, Arc::new(body)))
                .collect(),
            default: default.map(Arc::new),
        }))))
    }

    /// `return(value)`.
    pub fn ret(self, value: Option<Expr>) -> Self {
        self.push(Ok(Oper::Return(Arc::new(Return { value }))))
    }

    /// `break`.
    pub fn brk(self) -> Self {
        self.push(Ok(Oper::Break))
    }

    /// `continue`.
    pub fn cont(self) -> Self {
        self.push(Ok(Oper::Continue))
    }

    /// `yield expr`.
    pub fn yield_expr(self, expr: Expr) -> Self {
        self.push(Ok(Oper::Yield(Arc::new(expr))))
    }

    /// `| uniq`.
    pub fn uniq(self) -> Self {
        self.push(Ok(Oper::Uniq))
    }

    /// `| limit n`.
    pub fn limit(self, count: Expr) -> Self {
        self.push(Ok(Oper::Limit(Arc::new(count))))
    }

    /// `| spin`.
    pub fn spin(self) -> Self {
        self.push(Ok(Oper::Spin))
    }

    /// Finishes the query.
    pub fn build(self) -> Result<Query> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(Query::new(self.opers)),
        }
    }
}

/// Accumulates the edits of one `[ ... ]` block or parenthetical.
#[derive(Default)]
pub struct EditBuilder {
    edits: Vec<Edit>,
    error: Option<StormError>,
}

impl EditBuilder {
    fn record(&mut self, edit: Result<Edit>) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        match edit {
            Ok(edit) => self.edits.push(edit),
            Err(err) => self.error = Some(err),
        }
        self
    }

    fn finish(self) -> Result<Vec<Edit>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.edits),
        }
    }

    /// `form=value`.
    pub fn node(&mut self, form: &str, value: Expr) -> &mut Self {
        self.record(Ok(Edit::NodeAdd(Arc::new(node_add(form, value, false)))))
    }

    /// `form?=value`.
    pub fn try_node(&mut self, form: &str, value: Expr) -> &mut Self {
        self.record(Ok(Edit::NodeAdd(Arc::new(node_add(form, value, true)))))
    }

    /// `:prop=value` or `.univ=value`.
    pub fn set(&mut self, prop: &str, value: Expr) -> &mut Self {
        let edit = PropRef::parse(prop).map(|prop| {
            Edit::PropSet(Arc::new(PropSet {
                prop,
                value,
                try_set: false,
            }))
        });
        self.record(edit)
    }

    /// `:prop?=value` or `.univ?=value`.
    pub fn try_set(&mut self, prop: &str, value: Expr) -> &mut Self {
        let edit = PropRef::parse(prop).map(|prop| {
            Edit::PropSet(Arc::new(PropSet {
                prop,
                value,
                try_set: true,
            }))
        });
        self.record(edit)
    }

    /// `-:prop` or `-.univ`.
    pub fn del(&mut self, prop: &str) -> &mut Self {
        let edit = PropRef::parse(prop).map(|prop| Edit::PropDel(Arc::new(prop)));
        self.record(edit)
    }

    /// `+#tag`.
    pub fn tag(&mut self, tag: &str) -> &mut Self {
        let edit = plain_tag(tag).map(|tag| Edit::TagAdd(Arc::new(TagAdd { tag, ival: None })));
        self.record(edit)
    }

    /// `+#tag=ival`.
    pub fn tag_ival(&mut self, tag: &str, ival: Expr) -> &mut Self {
        let edit = plain_tag(tag).map(|tag| {
            Edit::TagAdd(Arc::new(TagAdd {
                tag,
                ival: Some(ival),
            }))
        });
        self.record(edit)
    }

    /// `-#tag`.
    pub fn untag(&mut self, tag: &str) -> &mut Self {
        let edit = plain_tag(tag).map(|tag| Edit::TagDel(Arc::new(tag)));
        self.record(edit)
    }

    /// `+#tag:prop=value`.
    pub fn tag_prop(&mut self, tag: &str, prop: &str, value: Expr) -> &mut Self {
        let edit = plain_tag(tag).map(|tag| {
            Edit::TagPropSet(Arc::new(TagPropSet {
                tag,
                prop: prop.into(),
                value,
            }))
        });
        self.record(edit)
    }

    /// `-#tag:prop`.
    pub fn del_tag_prop(&mut self, tag: &str, prop: &str) -> &mut Self {
        let edit = plain_tag(tag).map(|tag| {
            Edit::TagPropDel(Arc::new(TagPropDel {
                tag,
                prop: prop.into(),
            }))
        });
        self.record(edit)
    }

    /// `( form=value ... )`: the closure adds edits applied only to the new node.
    pub fn parens<F>(&mut self, form: &str, value: Expr, build: F) -> &mut Self
    where
        F: FnOnce(&mut EditBuilder),
    {
        let mut inner = EditBuilder::default();
        build(&mut inner);
        let edit = inner.finish().map(|edits| {
            Edit::Parens(Arc::new(EditParens {
                add: Arc::new(node_add(form, value, false)),
                edits,
            }))
        });
        self.record(edit)
    }

    /// Takes the accumulated edits, leaving the builder empty.
    pub fn take(&mut self) -> Result<Vec<Edit>> {
        let builder = mem::take(self);
        builder.finish()
    }
}

fn node_add(form: &str, value: Expr, try_set: bool) -> NodeAdd {
    NodeAdd {
        form: form.into(),
        value,
        try_set,
    }
}

fn plain_tag(text: &str) -> Result<TagMatch> {
    let tag = TagMatch::parse(text)?;
    if tag.has_glob() {
        return Err(StormError::bad_valu(
            "syn:tag",
            text,
            "wildcards are only valid in tag filters, lifts and pivots",
        ));
    }
    Ok(tag)
}

fn pivot_target(text: &str) -> Result<PivotTarget> {
    if text == "*" {
        return Ok(PivotTarget::Any);
    }
    if text.starts_with('#') {
        return TagMatch::parse(text).map(PivotTarget::Tags);
    }
    Ok(PivotTarget::Form(text.into()))
}

/// Comparator and operand pair.
pub fn cmp(cmpr: &str, value: Expr) -> Cmp {
    Cmp {
        cmpr: cmpr.into(),
        value,
    }
}

/// Literal expression.
pub fn lit(value: impl Into<Prim>) -> Expr {
    Expr::new(ExprKind::Const(value.into()))
}

/// Null literal.
pub fn null() -> Expr {
    Expr::new(ExprKind::Const(Prim::Null))
}

/// `(a, b, ...)` list literal.
pub fn list(items: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::List(items))
}

/// Dict literal.
pub fn dict(items: Vec<(Expr, Expr)>) -> Expr {
    Expr::new(ExprKind::Dict(items))
}

/// `$name`.
pub fn var(name: &str) -> Expr {
    Expr::new(ExprKind::Var(name.into()))
}

/// `$node`.
pub fn node() -> Expr {
    Expr::new(ExprKind::Node)
}

/// `:prop` or `:$var` on the current node.
pub fn prop(name: &str) -> Expr {
    Expr::new(ExprKind::RelProp(Name::parse(name)))
}

/// `.univ` on the current node.
pub fn univ(name: &str) -> Expr {
    Expr::new(ExprKind::UnivProp(Name::parse(name)))
}

/// `#tag` interval on the current node.
pub fn tag_value(tag: &str) -> Result<Expr> {
    Ok(Expr::new(ExprKind::TagValue(TagMatch::parse(tag)?)))
}

/// `$base.key`; a key starting with `$` is read from that variable.
pub fn deref(base: Expr, key: &str) -> Expr {
    Expr::new(ExprKind::Deref {
        base: Box::new(base),
        key: Name::parse(key),
    })
}

/// `$lib.path.to.member`.
pub fn lib(path: &str) -> Expr {
    path.split('.').fold(var("lib"), deref)
}

/// Positional call.
pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
    call_kw(func, args, Vec::new())
}

/// Call with keyword arguments.
pub fn call_kw(func: Expr, args: Vec<Expr>, kwargs: Vec<(&str, Expr)>) -> Expr {
    Expr::new(ExprKind::Call {
        func: Box::new(func),
        args,
        kwargs: kwargs
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value))
            .collect(),
    })
}

/// `$base.name(args)`.
pub fn method(base: Expr, name: &str, args: Vec<Expr>) -> Expr {
    call(deref(base, name), args)
}

/// Binary operation.
pub fn binop(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::new(ExprKind::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

/// `not expr`.
pub fn not(expr: Expr) -> Expr {
    Expr::new(ExprKind::Not(Box::new(expr)))
}

/// `+form`.
pub fn is_form(form: &str) -> Cond {
    Cond::Form(form.into())
}

/// `+form:prop` or `+form.univ` presence.
pub fn has_abs(prop: &str) -> Cond {
    Cond::AbsProp {
        prop: prop.into(),
        cmp: None,
    }
}

/// `+form:prop cmpr value`, or `+form cmpr value` for the primary value.
pub fn abs_cmp(prop: &str, cmpr: &str, value: Expr) -> Cond {
    Cond::AbsProp {
        prop: prop.into(),
        cmp: Some(cmp(cmpr, value)),
    }
}

/// `+:prop` / `+.univ` presence.
pub fn has(prop: &str) -> Result<Cond> {
    Ok(Cond::Prop {
        prop: PropRef::parse(prop)?,
        cmp: None,
    })
}

/// `+:prop cmpr value`.
pub fn prop_cmp(prop: &str, cmpr: &str, value: Expr) -> Result<Cond> {
    Ok(Cond::Prop {
        prop: PropRef::parse(prop)?,
        cmp: Some(cmp(cmpr, value)),
    })
}

/// `+:prop*[cmpr value]`.
pub fn array_cmp(prop: &str, cmpr: &str, value: Expr) -> Result<Cond> {
    Ok(Cond::Array {
        prop: PropRef::parse(prop)?,
        cmp: cmp(cmpr, value),
    })
}

/// `+#tag` (wildcards allowed).
pub fn tagged(tag: &str) -> Result<Cond> {
    Ok(Cond::Tag {
        tag: TagMatch::parse(tag)?,
        cmp: None,
    })
}

/// `+#tag cmpr value`.
pub fn tag_cmp(tag: &str, cmpr: &str, value: Expr) -> Result<Cond> {
    Ok(Cond::Tag {
        tag: TagMatch::parse(tag)?,
        cmp: Some(cmp(cmpr, value)),
    })
}

/// `+$(expr)`.
pub fn expr_cond(expr: Expr) -> Cond {
    Cond::Expr(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TagPart;

    #[test]
    fn tag_patterns_parse_variables_and_globs() -> Result<()> {
        let tag = TagMatch::parse("#base.$var.*")?;
        assert!(matches!(tag.parts[0], TagPart::Static(ref s) if s == "base"));
        assert!(matches!(tag.parts[1], TagPart::Dynamic(_)));
        assert!(matches!(tag.parts[2], TagPart::Glob));
        Ok(())
    }

    #[test]
    fn edit_tags_reject_globs() {
        let err = QueryBuilder::new()
            .edit(|e| {
                e.tag("#foo.*");
            })
            .build()
            .expect_err("glob in edit");
        assert_eq!(err.code(), "BadTypeValu");
    }

    #[test]
    fn nested_errors_surface_from_build() {
        let err = QueryBuilder::new()
            .lift_form("test:str")
            .subquery(|q| q.prop_pivot("hehe", "*"))
            .build()
            .expect_err("prop without prefix");
        assert_eq!(err.code(), "NoSuchProp");
    }

    #[test]
    fn lib_paths_chain_derefs() {
        let expr = lib("print");
        match expr.kind {
            ExprKind::Deref { base, key } => {
                assert!(matches!(base.kind, ExprKind::Var(ref v) if v == "lib"));
                assert!(matches!(key, Name::Static(ref k) if k == "print"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
