//! Abstract syntax tree for storm queries.
//!
//! Trees are immutable once built. Operator payloads are reference counted so
//! that every running pipeline stage can hold its own handle without copying, and
//! each [`Expr`] caches the runtsafety classification computed by
//! [`crate::analyze`].

mod builder;

use std::sync::{Arc, OnceLock};

use crate::error::{Result, StormError};
use crate::prim::Prim;

pub use builder::*;

/// A sequence of pipeline operators.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Operators in execution order.
    pub opers: Vec<Oper>,
    pub(crate) analysis: OnceLock<Result<()>>,
}

impl Query {
    /// Creates a query from operators.
    pub fn new(opers: Vec<Oper>) -> Self {
        Self {
            opers,
            analysis: OnceLock::new(),
        }
    }
}

/// Pipeline operator.
#[derive(Debug, Clone)]
pub enum Oper {
    /// Produce nodes from storage.
    Lift(Arc<Lift>),
    /// Keep or drop nodes.
    Filter(Arc<Filter>),
    /// Follow typed references.
    Pivot(Arc<Pivot>),
    /// `{ ... }` per-node inner pipeline.
    SubQuery(Arc<SubQuery>),
    /// `[ ... ]` edit block.
    Edit(Arc<EditBlock>),
    /// `$x = ...` or `($a, $b) = ...`.
    SetVar(Arc<SetVar>),
    /// `$x.key = ...`.
    SetItem(Arc<SetItem>),
    /// Expression evaluated for its side effects, typically a call.
    Expr(Arc<Expr>),
    /// `function name(params) { ... }`.
    Function(Arc<FuncDef>),
    /// `init { ... }`.
    Init(Arc<Query>),
    /// `fini { ... }`.
    Fini(Arc<Query>),
    /// `for $x in ... { ... }`.
    For(Arc<ForLoop>),
    /// `if ... { } elif ... { } else { }`.
    If(Arc<IfElse>),
    /// `return(...)`.
    Return(Arc<Return>),
    /// `break`.
    Break,
    /// `continue`.
    Continue,
    /// `yield $func(...)`: emit the nodes a function or expression produces.
    Yield(Arc<Expr>),
    /// `| uniq`: drop nodes already seen.
    Uniq,
    /// `| limit n`.
    Limit(Arc<Expr>),
    /// `| spin`: consume nodes without emitting them.
    Spin,
}

/// Expression node with its cached runtsafety flag.
#[derive(Debug, Clone)]
pub struct Expr {
    /// Expression shape.
    pub kind: ExprKind,
    pub(crate) safe: OnceLock<bool>,
}

impl Expr {
    /// Wraps an expression kind.
    pub fn new(kind: ExprKind) -> Self {
        Self {
            kind,
            safe: OnceLock::new(),
        }
    }

    /// Runtsafety as computed by the analyzer. Unanalyzed expressions report
    /// `false`, which makes the engine evaluate them per node.
    pub fn is_runtsafe(&self) -> bool {
        self.safe.get().copied().unwrap_or(false)
    }
}

/// Expression shapes.
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Literal primitive.
    Const(Prim),
    /// `(a, b, c)` list literal.
    List(Vec<Expr>),
    /// `({"k": v})` dict literal.
    Dict(Vec<(Expr, Expr)>),
    /// `$name`.
    Var(String),
    /// `$node`.
    Node,
    /// `:prop` on the current node.
    RelProp(Name),
    /// `.univ` on the current node.
    UnivProp(Name),
    /// `#tag` interval on the current node.
    TagValue(TagMatch),
    /// `$base.key` / `$base.$key`.
    Deref {
        /// Value being dereferenced.
        base: Box<Expr>,
        /// Static or variable key.
        key: Name,
    },
    /// `func(args, key=value)`.
    Call {
        /// Callee.
        func: Box<Expr>,
        /// Positional arguments.
        args: Vec<Expr>,
        /// Keyword arguments in source order.
        kwargs: Vec<(String, Expr)>,
    },
    /// Binary arithmetic, comparison, or boolean operator.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// `not expr`.
    Not(Box<Expr>),
}

/// Binary operators usable in `$( ... )` expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `and`
    And,
    /// `or`
    Or,
}

/// Identifier that is either literal or read from a variable (`:$var`).
#[derive(Debug, Clone)]
pub enum Name {
    /// Literal identifier.
    Static(String),
    /// Identifier taken from an expression result.
    Dynamic(Box<Expr>),
}

impl Name {
    /// Parses `"hehe"` as static and `"$var"` as a variable reference.
    pub fn parse(text: &str) -> Self {
        match text.strip_prefix('$') {
            Some(var) => Name::Dynamic(Box::new(Expr::new(ExprKind::Var(var.to_owned())))),
            None => Name::Static(text.to_owned()),
        }
    }

    /// Whether the name can be resolved without a bound node.
    pub fn is_runtsafe(&self) -> bool {
        match self {
            Name::Static(_) => true,
            Name::Dynamic(expr) => expr.is_runtsafe(),
        }
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::parse(value)
    }
}

/// Reference to a node-relative property (`:prop`) or universal property (`.univ`).
#[derive(Debug, Clone)]
pub struct PropRef {
    /// Property name.
    pub name: Name,
    /// Whether this is a universal property.
    pub univ: bool,
}

impl PropRef {
    /// Parses `":hehe"`, `":$var"`, `".seen"` or `".$var"`.
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(rest) = text.strip_prefix(':') {
            return Ok(Self {
                name: Name::parse(rest),
                univ: false,
            });
        }
        if let Some(rest) = text.strip_prefix('.') {
            return Ok(Self {
                name: Name::parse(rest),
                univ: true,
            });
        }
        Err(StormError::NoSuchProp {
            name: text.to_owned(),
        })
    }
}

/// One segment of a tag reference.
#[derive(Debug, Clone)]
pub enum TagPart {
    /// Literal segment.
    Static(String),
    /// Segment read from a variable.
    Dynamic(Box<Expr>),
    /// `*` wildcard matching exactly one segment.
    Glob,
}

/// Dotted tag reference such as `#base.$var.*`.
#[derive(Debug, Clone)]
pub struct TagMatch {
    /// Segments in order.
    pub parts: Vec<TagPart>,
}

impl TagMatch {
    /// Parses `"#base.$var.*"` (the leading `#` is optional).
    pub fn parse(text: &str) -> Result<Self> {
        let body = text.strip_prefix('#').unwrap_or(text);
        let mut parts = Vec::new();
        for seg in body.split('.') {
            if seg.is_empty() {
                return Err(StormError::bad_valu("syn:tag", text, "empty tag segment"));
            }
            let part = match seg {
                "*" => TagPart::Glob,
                _ => match seg.strip_prefix('$') {
                    Some(var) => {
                        TagPart::Dynamic(Box::new(Expr::new(ExprKind::Var(var.to_owned()))))
                    }
                    None => TagPart::Static(seg.to_owned()),
                },
            };
            parts.push(part);
        }
        Ok(Self { parts })
    }

    /// Whether the pattern contains a wildcard.
    pub fn has_glob(&self) -> bool {
        self.parts.iter().any(|part| matches!(part, TagPart::Glob))
    }

    /// Whether every variable segment is runtsafe.
    pub fn is_runtsafe(&self) -> bool {
        self.parts.iter().all(|part| match part {
            TagPart::Dynamic(expr) => expr.is_runtsafe(),
            _ => true,
        })
    }
}

/// Comparator plus operand.
#[derive(Debug, Clone)]
pub struct Cmp {
    /// Comparator, e.g. `=`, `^=`, `range=`.
    pub cmpr: String,
    /// Operand.
    pub value: Expr,
}

/// Lift operator variants.
#[derive(Debug, Clone)]
pub enum Lift {
    /// Every node of a form.
    Form {
        /// Form name.
        form: String,
    },
    /// By full property name (`test:str`, `test:str:hehe`, `.seen`, `test:str.seen`).
    Prop {
        /// Full property name.
        prop: String,
        /// Optional comparison; absent means "has the property".
        cmp: Option<Cmp>,
    },
    /// `prop*[cmpr=value]` on an array property.
    Array {
        /// Full property name.
        prop: String,
        /// Element comparison.
        cmp: Cmp,
    },
    /// By tag, optionally restricted to a form and tag interval comparison.
    Tag {
        /// Tag reference; may contain wildcards.
        tag: TagMatch,
        /// Optional form restriction.
        form: Option<String>,
        /// Optional interval comparison.
        cmp: Option<Cmp>,
    },
}

/// `+cond` / `-cond`.
#[derive(Debug, Clone)]
pub struct Filter {
    /// `true` for `+`, `false` for `-`.
    pub keep: bool,
    /// Condition.
    pub cond: Cond,
}

/// Filter conditions.
#[derive(Debug, Clone)]
pub enum Cond {
    /// Node is of the form.
    Form(String),
    /// Absolute property test (`test:str=foo`, `test:str:hehe^=x`, `test:str:hehe`).
    AbsProp {
        /// Full property name.
        prop: String,
        /// Optional comparison.
        cmp: Option<Cmp>,
    },
    /// Relative property test (`:hehe`, `:hehe=x`, `.seen`).
    Prop {
        /// Property reference.
        prop: PropRef,
        /// Optional comparison; absent means "is set".
        cmp: Option<Cmp>,
    },
    /// Any element of an array property satisfies the comparison.
    Array {
        /// Property reference.
        prop: PropRef,
        /// Element comparison.
        cmp: Cmp,
    },
    /// Tag presence or interval comparison.
    Tag {
        /// Tag reference.
        tag: TagMatch,
        /// Optional interval comparison.
        cmp: Option<Cmp>,
    },
    /// Arbitrary boolean expression.
    Expr(Expr),
    /// Logical negation.
    Not(Box<Cond>),
    /// All conditions hold.
    And(Vec<Cond>),
    /// At least one condition holds.
    Or(Vec<Cond>),
}

/// Pivot direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotDir {
    /// `->`
    Out,
    /// `<-`
    In,
}

/// Pivot destination.
#[derive(Debug, Clone)]
pub enum PivotTarget {
    /// `*`
    Any,
    /// A form name.
    Form(String),
    /// `#tag` pattern, pivoting to `syn:tag` nodes.
    Tags(TagMatch),
}

/// `-> target`, `<- target`, or `:prop -> target`.
#[derive(Debug, Clone)]
pub struct Pivot {
    /// Direction.
    pub dir: PivotDir,
    /// Source property for prop pivots.
    pub src: Option<PropRef>,
    /// Destination.
    pub target: PivotTarget,
}

/// `{ ... }` or `yield { ... }`.
#[derive(Debug, Clone)]
pub struct SubQuery {
    /// Inner pipeline.
    pub query: Arc<Query>,
    /// Whether inner nodes are emitted into the outer pipeline.
    pub yields: bool,
}

/// `[ ... ]`.
#[derive(Debug, Clone, Default)]
pub struct EditBlock {
    /// Edits applied in order.
    pub edits: Vec<Edit>,
}

/// Node edit operators.
#[derive(Debug, Clone)]
pub enum Edit {
    /// `form=value` / `form?=value`.
    NodeAdd(Arc<NodeAdd>),
    /// `:prop=value` / `.univ=value`.
    PropSet(Arc<PropSet>),
    /// `-:prop` / `-.univ`.
    PropDel(Arc<PropRef>),
    /// `+#tag` / `+#tag=(min, max)`.
    TagAdd(Arc<TagAdd>),
    /// `-#tag`.
    TagDel(Arc<TagMatch>),
    /// `+#tag:prop=value`.
    TagPropSet(Arc<TagPropSet>),
    /// `-#tag:prop`.
    TagPropDel(Arc<TagPropDel>),
    /// `( form=value ... )`.
    Parens(Arc<EditParens>),
}

/// Node creation.
#[derive(Debug, Clone)]
pub struct NodeAdd {
    /// Form to create.
    pub form: String,
    /// Primary value.
    pub value: Expr,
    /// `?=`: skip silently when normalization fails.
    pub try_set: bool,
}

/// Property or universal property assignment.
#[derive(Debug, Clone)]
pub struct PropSet {
    /// Target property.
    pub prop: PropRef,
    /// New value.
    pub value: Expr,
    /// `?=`: skip silently when normalization fails.
    pub try_set: bool,
}

/// Tag application.
#[derive(Debug, Clone)]
pub struct TagAdd {
    /// Tag name (no wildcards).
    pub tag: TagMatch,
    /// Optional validity interval.
    pub ival: Option<Expr>,
}

/// Tag property assignment.
#[derive(Debug, Clone)]
pub struct TagPropSet {
    /// Tag name.
    pub tag: TagMatch,
    /// Tag property name.
    pub prop: String,
    /// New value.
    pub value: Expr,
}

/// Tag property removal.
#[derive(Debug, Clone)]
pub struct TagPropDel {
    /// Tag name.
    pub tag: TagMatch,
    /// Tag property name.
    pub prop: String,
}

/// Edit parenthetical: a node creation followed by edits that apply only to it.
#[derive(Debug, Clone)]
pub struct EditParens {
    /// Subject node creation.
    pub add: Arc<NodeAdd>,
    /// Trailing edits, which may nest further parentheticals.
    pub edits: Vec<Edit>,
}

/// Variable assignment, with tuple unpacking when more than one name is given.
#[derive(Debug, Clone)]
pub struct SetVar {
    /// Target names.
    pub names: Vec<String>,
    /// Assigned value.
    pub value: Expr,
}

/// Item assignment on a container.
#[derive(Debug, Clone)]
pub struct SetItem {
    /// Container expression.
    pub base: Expr,
    /// Key.
    pub key: Name,
    /// Assigned value.
    pub value: Expr,
}

/// Function definition.
#[derive(Debug, Clone)]
pub struct FuncDef {
    /// Binding name.
    pub name: String,
    /// Declared parameters.
    pub params: Vec<String>,
    /// Body.
    pub body: Arc<Query>,
}

/// `for` loop.
#[derive(Debug, Clone)]
pub struct ForLoop {
    /// Loop variables; more than one unpacks each item.
    pub vars: Vec<String>,
    /// Iterated expression.
    pub iter: Expr,
    /// Loop body.
    pub body: Arc<Query>,
}

/// `if` / `elif` / `else`.
#[derive(Debug, Clone)]
pub struct IfElse {
    /// Conditions with their bodies, tested in order.
    pub clauses: Vec<(Expr, Arc<Query>)>,
    /// `else` body.
    pub default: Option<Arc<Query>>,
}

/// `return` with optional value.
#[derive(Debug, Clone)]
pub struct Return {
    /// Returned value; `None` returns null.
    pub value: Option<Expr>,
}
