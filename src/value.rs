//! Runtime values flowing through variables, expressions and calls.
//!
//! Scalars are copied on bind. Lists, dicts and sets are shared containers: every
//! clone of a [`Value::Dict`] observes mutations made through any other clone,
//! which is what makes `$y.$key = v` visible to every holder of `$y`.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Number, Value as Json};

use crate::ast::FuncDef;
use crate::error::{Result, StormError};
use crate::node::Node;
use crate::prim::Prim;
use crate::runtime::Frame;
use crate::spooled::SpooledSet;

/// Insertion-ordered mapping backing `$lib.dict()`.
pub type DictMap = IndexMap<Prim, Value>;

/// Named counters backing `$lib.stats.tally()`, in first-increment order.
pub type Tally = IndexMap<String, i64>;

/// Runtime value.
#[derive(Clone)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Node snapshot.
    Node(Arc<Node>),
    /// Shared ordered sequence.
    List(Arc<Mutex<Vec<Value>>>),
    /// Shared insertion-ordered mapping.
    Dict(Arc<Mutex<DictMap>>),
    /// Shared set of primitives, spooled to disk past the configured threshold.
    Set(Arc<Mutex<SpooledSet>>),
    /// Shared named counters.
    Tally(Arc<Mutex<Tally>>),
    /// Callable.
    Func(Function),
    /// `$lib` or an imported module.
    Lib(Library),
}

/// Discriminant of a [`Value`], used for method tables and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// [`Value::Null`]
    Null,
    /// [`Value::Bool`]
    Bool,
    /// [`Value::Int`]
    Int,
    /// [`Value::Float`]
    Float,
    /// [`Value::Str`]
    Str,
    /// [`Value::Bytes`]
    Bytes,
    /// [`Value::Node`]
    Node,
    /// [`Value::List`]
    List,
    /// [`Value::Dict`]
    Dict,
    /// [`Value::Set`]
    Set,
    /// [`Value::Tally`]
    Tally,
    /// [`Value::Func`]
    Func,
    /// [`Value::Lib`]
    Lib,
}

impl ValueKind {
    /// Human readable kind name.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "Null",
            ValueKind::Bool => "Bool",
            ValueKind::Int => "Int",
            ValueKind::Float => "Float",
            ValueKind::Str => "Str",
            ValueKind::Bytes => "Bytes",
            ValueKind::Node => "Node",
            ValueKind::List => "List",
            ValueKind::Dict => "Dict",
            ValueKind::Set => "Set",
            ValueKind::Tally => "StatTally",
            ValueKind::Func => "Function",
            ValueKind::Lib => "Library",
        }
    }
}

/// Callable value.
#[derive(Clone)]
pub enum Function {
    /// User defined function bound to its defining frame.
    Closure(Arc<Closure>),
    /// `$lib` member.
    Lib(&'static str),
    /// Method bound to its receiver, e.g. `$node.value`.
    Method(Arc<BoundMethod>),
}

/// Function definition paired with the frame chain active at definition time.
pub struct Closure {
    pub(crate) def: Arc<FuncDef>,
    pub(crate) frame: Arc<Frame>,
}

impl Closure {
    /// Declared name.
    pub fn name(&self) -> &str {
        &self.def.name
    }
}

/// Builtin method bound to a receiver.
pub struct BoundMethod {
    pub(crate) recv: Value,
    pub(crate) name: &'static str,
}

/// Library namespace handle.
#[derive(Clone)]
pub enum Library {
    /// `$lib`.
    Root,
    /// `$lib.stats`.
    Stats,
    /// Module returned by `$lib.import`.
    Module(Arc<Module>),
}

/// Imported module: its name and the frame its top level ran in.
pub struct Module {
    pub(crate) name: String,
    pub(crate) frame: Arc<Frame>,
}

impl Value {
    /// Kind discriminant.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Node(_) => ValueKind::Node,
            Value::List(_) => ValueKind::List,
            Value::Dict(_) => ValueKind::Dict,
            Value::Set(_) => ValueKind::Set,
            Value::Tally(_) => ValueKind::Tally,
            Value::Func(_) => ValueKind::Func,
            Value::Lib(_) => ValueKind::Lib,
        }
    }

    /// New shared list.
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(Mutex::new(items)))
    }

    /// New shared dict.
    pub fn dict(items: DictMap) -> Value {
        Value::Dict(Arc::new(Mutex::new(items)))
    }

    /// String value.
    pub fn str(text: impl Into<String>) -> Value {
        Value::Str(text.into())
    }

    /// Lifts a stored primitive into a runtime value.
    pub fn from_prim(prim: &Prim) -> Value {
        match prim {
            Prim::Null => Value::Null,
            Prim::Bool(v) => Value::Bool(*v),
            Prim::Int(v) => Value::Int(*v),
            Prim::Float(v) => Value::Float(*v),
            Prim::Str(v) => Value::Str(v.clone()),
            Prim::Bytes(v) => Value::Bytes(v.clone()),
            Prim::List(items) => Value::list(items.iter().map(Value::from_prim).collect()),
        }
    }

    /// Converts into a storable primitive. Nodes become their `(form, value)`
    /// pair and sets become lists of their members.
    pub fn to_prim(&self) -> Result<Prim> {
        self.to_prim_in(&mut Vec::new())
    }

    fn to_prim_in(&self, path: &mut Vec<usize>) -> Result<Prim> {
        Ok(match self {
            Value::Null => Prim::Null,
            Value::Bool(v) => Prim::Bool(*v),
            Value::Int(v) => Prim::Int(*v),
            Value::Float(v) => Prim::Float(*v),
            Value::Str(v) => Prim::Str(v.clone()),
            Value::Bytes(v) => Prim::Bytes(v.clone()),
            Value::Node(node) => node.ndef_prim(),
            Value::List(items) => {
                let id = container_id(items);
                if path.contains(&id) {
                    return Err(StormError::bad_valu(
                        "List",
                        self,
                        "recursive List values cannot be stored",
                    ));
                }
                let items = snapshot(items);
                path.push(id);
                let out = items
                    .iter()
                    .map(|item| item.to_prim_in(path))
                    .collect::<Result<_>>();
                path.pop();
                Prim::List(out?)
            }
            Value::Set(set) => Prim::List(set.lock().to_vec()?),
            Value::Dict(_) | Value::Tally(_) | Value::Func(_) | Value::Lib(_) => {
                return Err(StormError::bad_valu(
                    self.kind().name(),
                    self,
                    format!("{} values cannot be stored", self.kind().name()),
                ));
            }
        })
    }

    /// Renders as JSON for `fire` data, `warn` info and error details.
    pub fn to_json(&self) -> Result<Json> {
        self.to_json_in(&mut Vec::new())
    }

    fn to_json_in(&self, path: &mut Vec<usize>) -> Result<Json> {
        Ok(match self {
            Value::Null => Json::Null,
            Value::Bool(v) => Json::Bool(*v),
            Value::Int(v) => Json::from(*v),
            Value::Float(v) => Number::from_f64(*v).map_or(Json::Null, Json::Number),
            Value::Str(v) => Json::String(v.clone()),
            Value::Bytes(v) => Json::String(base64::engine::general_purpose::STANDARD.encode(v)),
            Value::Node(node) => Json::Array(vec![
                Json::String(node.form.clone()),
                prim_to_json(&node.valu),
            ]),
            Value::List(items) => {
                let id = container_id(items);
                if path.contains(&id) {
                    return Err(recursive_json(self));
                }
                let items = snapshot(items);
                path.push(id);
                let out = items
                    .iter()
                    .map(|item| item.to_json_in(path))
                    .collect::<Result<_>>();
                path.pop();
                Json::Array(out?)
            }
            Value::Dict(items) => {
                let id = container_id(items);
                if path.contains(&id) {
                    return Err(recursive_json(self));
                }
                let items = snapshot(items);
                path.push(id);
                let mut out = Map::new();
                let mut failed = None;
                for (key, valu) in &items {
                    match valu.to_json_in(path) {
                        Ok(json) => {
                            out.insert(key.to_string(), json);
                        }
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                }
                path.pop();
                if let Some(err) = failed {
                    return Err(err);
                }
                Json::Object(out)
            }
            Value::Set(set) => Json::Array(set.lock().to_vec()?.iter().map(prim_to_json).collect()),
            Value::Tally(counts) => Json::Object(
                counts
                    .lock()
                    .iter()
                    .map(|(name, count)| (name.clone(), Json::from(*count)))
                    .collect(),
            ),
            Value::Func(_) | Value::Lib(_) => {
                return Err(StormError::runtime(format!(
                    "Unable to convert {} to a primitive.",
                    self.kind().name()
                ))
                .with("kind", self.kind().name()));
            }
        })
    }

    /// Builds a value from JSON. Objects become dicts keyed by string.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(v) => Value::Bool(*v),
            Json::Number(num) => match num.as_i64() {
                Some(v) => Value::Int(v),
                None => Value::Float(num.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(v) => Value::Str(v.clone()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(items) => Value::dict(
                items
                    .iter()
                    .map(|(key, valu)| (Prim::Str(key.clone()), Value::from_json(valu)))
                    .collect(),
            ),
        }
    }

    /// Display form used by `print` formatting and dynamic names.
    ///
    /// A container reached again while rendering itself shows as `(...)` or
    /// `{...}`.
    pub fn repr(&self) -> String {
        self.repr_in(&mut Vec::new())
    }

    fn repr_in(&self, path: &mut Vec<usize>) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(v) => v.clone(),
            Value::Bytes(v) => hex::encode(v),
            Value::Node(node) => node.repr(),
            Value::List(items) => {
                let id = container_id(items);
                if path.contains(&id) {
                    return "(...)".into();
                }
                let items = snapshot(items);
                path.push(id);
                let parts: Vec<String> = items.iter().map(|item| item.repr_in(path)).collect();
                path.pop();
                format!("({})", parts.join(", "))
            }
            Value::Dict(items) => {
                let id = container_id(items);
                if path.contains(&id) {
                    return "{...}".into();
                }
                let items = snapshot(items);
                path.push(id);
                let parts: Vec<String> = items
                    .iter()
                    .map(|(key, valu)| format!("{key}: {}", valu.repr_in(path)))
                    .collect();
                path.pop();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Set(set) => {
                let parts: Vec<String> = match set.lock().to_vec() {
                    Ok(items) => items.iter().map(Prim::to_string).collect(),
                    Err(_) => Vec::new(),
                };
                format!("{{{}}}", parts.join(", "))
            }
            Value::Tally(counts) => {
                let parts: Vec<String> = counts
                    .lock()
                    .iter()
                    .map(|(name, count)| format!("{name}: {count}"))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Func(Function::Closure(closure)) => format!("<function {}>", closure.name()),
            Value::Func(Function::Lib(name)) => format!("<function $lib.{name}>"),
            Value::Func(Function::Method(method)) => format!("<method {}>", method.name),
            Value::Lib(Library::Root) => "$lib".into(),
            Value::Lib(Library::Stats) => "$lib.stats".into(),
            Value::Lib(Library::Module(module)) => format!("<module {}>", module.name),
        }
    }

    /// Truthiness used by `if`, filters and boolean operators.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(v) => !v.is_empty(),
            Value::Bytes(v) => !v.is_empty(),
            Value::Node(_) | Value::Func(_) | Value::Lib(_) => true,
            Value::List(items) => !items.lock().is_empty(),
            Value::Dict(items) => !items.lock().is_empty(),
            Value::Set(set) => !set.lock().is_empty(),
            Value::Tally(counts) => !counts.lock().is_empty(),
        }
    }
}

/// Address of a shared container, tracked while walking nested values.
fn container_id<T>(shared: &Arc<Mutex<T>>) -> usize {
    Arc::as_ptr(shared).cast::<()>() as usize
}

/// Copies a container's contents so no lock is held while walking its items.
fn snapshot<T: Clone>(shared: &Arc<Mutex<T>>) -> T {
    shared.lock().clone()
}

fn recursive_json(valu: &Value) -> StormError {
    StormError::runtime(format!(
        "Unable to convert recursive {} to a primitive.",
        valu.kind().name()
    ))
    .with("kind", valu.kind().name())
}

fn prim_to_json(prim: &Prim) -> Json {
    match prim {
        Prim::Null => Json::Null,
        Prim::Bool(v) => Json::Bool(*v),
        Prim::Int(v) => Json::from(*v),
        Prim::Float(v) => Number::from_f64(*v).map_or(Json::Null, Json::Number),
        Prim::Str(v) => Json::String(v.clone()),
        Prim::Bytes(v) => Json::String(base64::engine::general_purpose::STANDARD.encode(v)),
        Prim::List(items) => Json::Array(items.iter().map(prim_to_json).collect()),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_in(other, &mut Vec::new())
    }
}

impl Value {
    /// Structural equality. A pair of containers met again while comparing
    /// themselves is taken as equal.
    fn eq_in(&self, other: &Value, path: &mut Vec<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Node(a), Value::Node(b)) => a.ndef() == b.ndef(),
            (Value::List(a), Value::List(b)) => {
                let pair = (container_id(a), container_id(b));
                if Arc::ptr_eq(a, b) || path.contains(&pair) {
                    return true;
                }
                let (lhs, rhs) = (snapshot(a), snapshot(b));
                if lhs.len() != rhs.len() {
                    return false;
                }
                path.push(pair);
                let same = lhs.iter().zip(&rhs).all(|(x, y)| x.eq_in(y, path));
                path.pop();
                same
            }
            (Value::Dict(a), Value::Dict(b)) => {
                let pair = (container_id(a), container_id(b));
                if Arc::ptr_eq(a, b) || path.contains(&pair) {
                    return true;
                }
                let (lhs, rhs) = (snapshot(a), snapshot(b));
                if lhs.len() != rhs.len() {
                    return false;
                }
                path.push(pair);
                let same = lhs
                    .iter()
                    .all(|(key, x)| rhs.get(key).is_some_and(|y| x.eq_in(y, path)));
                path.pop();
                same
            }
            (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b),
            (Value::Tally(a), Value::Tally(b)) => Arc::ptr_eq(a, b),
            (Value::Func(Function::Closure(a)), Value::Func(Function::Closure(b))) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Func(Function::Lib(a)), Value::Func(Function::Lib(b))) => a == b,
            (Value::Lib(Library::Root), Value::Lib(Library::Root)) => true,
            (Value::Lib(Library::Stats), Value::Lib(Library::Stats)) => true,
            (Value::Lib(Library::Module(a)), Value::Lib(Library::Module(b))) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind().name(), self.repr())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Value::Func(self.clone()).repr())
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Value::Lib(self.clone()).repr())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
