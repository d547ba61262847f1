//! Error taxonomy shared by the model, storage collaborators and the runtime.
//!
//! Every variant maps onto a stable kind string (see [`StormError::code`]) and a
//! structured detail mapping (see [`StormError::info`]). Both travel verbatim in
//! the terminal `err` event of a query stream.

use serde_json::{json, Map, Value as Json};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StormError>;

/// Structured detail attached to runtime errors.
pub type Info = Map<String, Json>;

/// Errors raised while building models, touching storage, or running queries.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StormError {
    /// Reference to an undeclared form.
    #[error("no such form: {name}")]
    NoSuchForm {
        /// Requested form name.
        name: String,
    },
    /// Reference to a property that the form (or universal set) does not declare.
    #[error("no such property: {name}")]
    NoSuchProp {
        /// Full property name, `form:prop` for form properties.
        name: String,
    },
    /// Reference to an undeclared universal property.
    #[error("no such universal property: {name}")]
    NoSuchUniv {
        /// Requested universal property name.
        name: String,
    },
    /// Reference to an undeclared type.
    #[error("no such type: {name}")]
    NoSuchType {
        /// Requested type name.
        name: String,
    },
    /// Comparator is not supported by the type.
    #[error("type {name} does not support comparator {cmpr}")]
    NoSuchCmpr {
        /// Comparator text, e.g. `^=`.
        cmpr: String,
        /// Type the comparator was applied to.
        name: String,
    },
    /// Unknown library member, method or module.
    #[error("no such name: {name}")]
    NoSuchName {
        /// Dotted path that failed to resolve.
        name: String,
    },
    /// Variable is unbound at every frame level.
    #[error("missing variable: {name}")]
    NoSuchVar {
        /// Variable name without the leading `$`.
        name: String,
    },
    /// No typed relationship exists between the pivot source and destination.
    #[error("no pivot from {src} to {dst}")]
    NoSuchPivot {
        /// Source form.
        src: String,
        /// Requested destination.
        dst: String,
    },
    /// Malformed type declaration.
    #[error("bad type definition {name}: {mesg}")]
    BadTypeDef {
        /// Type being declared.
        name: String,
        /// What is wrong with it.
        mesg: String,
    },
    /// Malformed property declaration.
    #[error("bad property definition {name}: {mesg}")]
    BadPropDef {
        /// Property being declared.
        name: String,
        /// What is wrong with it.
        mesg: String,
    },
    /// Malformed form declaration.
    #[error("bad form definition {name}: {mesg}")]
    BadFormDef {
        /// Form being declared.
        name: String,
        /// What is wrong with it.
        mesg: String,
    },
    /// Value cannot be normalized by a type.
    #[error("bad value for type {name}: {mesg}")]
    BadTypeValu {
        /// Type that rejected the value.
        name: String,
        /// Debug rendering of the rejected value.
        valu: String,
        /// Reason for the rejection.
        mesg: String,
    },
    /// Comparator applied to an incompatible structured type.
    #[error("{mesg}")]
    BadCmprType {
        /// Type the comparator was applied to.
        name: String,
        /// Comparator text.
        cmpr: String,
        /// Reason for the rejection.
        mesg: String,
    },
    /// Deref or property lookup on a key that does not resolve.
    #[error("{mesg}")]
    BadPropValu {
        /// Key that did not resolve.
        name: String,
        /// Human readable message.
        mesg: String,
    },
    /// General language-level runtime fault.
    #[error("{mesg}")]
    Runtime {
        /// Human readable message.
        mesg: String,
        /// Structured context such as `name`, `expected` and `got`.
        info: Info,
    },
    /// Access-control collaborator rejected the operation.
    #[error("user {user} lacks permission {perm}")]
    AuthDeny {
        /// User the query runs as.
        user: String,
        /// Dotted permission path that was refused.
        perm: String,
    },
    /// Query was cancelled by the consumer or timed out.
    #[error("query cancelled")]
    Cancelled,
    /// Filesystem failure in scratch space.
    #[error("io: {0}")]
    Io(/** Underlying error text. */ String),
    /// Disk-backed spool failure.
    #[error("spool: {0}")]
    Spool(/** Spool backend error text. */ String),
    /// Invalid runtime configuration.
    #[error("config: {0}")]
    Config(/** Offending setting and reason. */ String),
}

impl StormError {
    /// Builds a generic runtime error carrying `mesg`.
    pub fn runtime(mesg: impl Into<String>) -> Self {
        StormError::Runtime {
            mesg: mesg.into(),
            info: Info::new(),
        }
    }

    /// Attaches a context entry to a runtime error. Other kinds are returned as is.
    pub fn with(mut self, key: &str, valu: impl Into<Json>) -> Self {
        if let StormError::Runtime { info, .. } = &mut self {
            info.insert(key.to_owned(), valu.into());
        }
        self
    }

    /// Convenience for a type normalization failure.
    pub fn bad_valu(name: &str, valu: impl std::fmt::Debug, mesg: impl Into<String>) -> Self {
        StormError::BadTypeValu {
            name: name.to_owned(),
            valu: format!("{valu:?}"),
            mesg: mesg.into(),
        }
    }

    /// Stable kind name delivered to callers.
    pub fn code(&self) -> &'static str {
        match self {
            StormError::NoSuchForm { .. } => "NoSuchForm",
            StormError::NoSuchProp { .. } => "NoSuchProp",
            StormError::NoSuchUniv { .. } => "NoSuchUniv",
            StormError::NoSuchType { .. } => "NoSuchType",
            StormError::NoSuchCmpr { .. } => "NoSuchCmpr",
            StormError::NoSuchName { .. } => "NoSuchName",
            StormError::NoSuchVar { .. } => "NoSuchVar",
            StormError::NoSuchPivot { .. } => "NoSuchPivot",
            StormError::BadTypeDef { .. } => "BadTypeDef",
            StormError::BadPropDef { .. } => "BadPropDef",
            StormError::BadFormDef { .. } => "BadFormDef",
            StormError::BadTypeValu { .. } => "BadTypeValu",
            StormError::BadCmprType { .. } => "BadCmprType",
            StormError::BadPropValu { .. } => "BadPropValu",
            StormError::Runtime { .. } => "StormRuntimeError",
            StormError::AuthDeny { .. } => "AuthDeny",
            StormError::Cancelled => "Cancelled",
            StormError::Io(_) => "IoError",
            StormError::Spool(_) => "SpoolError",
            StormError::Config(_) => "ConfigError",
        }
    }

    /// Structured detail mapping. Always contains `mesg`.
    pub fn info(&self) -> Info {
        let mut out = match self {
            StormError::Runtime { info, .. } => info.clone(),
            _ => Info::new(),
        };
        out.insert("mesg".into(), json!(self.to_string()));
        match self {
            StormError::NoSuchForm { name }
            | StormError::NoSuchProp { name }
            | StormError::NoSuchUniv { name }
            | StormError::NoSuchType { name }
            | StormError::NoSuchName { name }
            | StormError::NoSuchVar { name }
            | StormError::BadTypeDef { name, .. }
            | StormError::BadPropDef { name, .. }
            | StormError::BadFormDef { name, .. }
            | StormError::BadPropValu { name, .. } => {
                out.insert("name".into(), json!(name));
            }
            StormError::NoSuchCmpr { cmpr, name } | StormError::BadCmprType { cmpr, name, .. } => {
                out.insert("name".into(), json!(name));
                out.insert("cmpr".into(), json!(cmpr));
            }
            StormError::NoSuchPivot { src, dst } => {
                out.insert("src".into(), json!(src));
                out.insert("dst".into(), json!(dst));
            }
            StormError::BadTypeValu { name, valu, .. } => {
                out.insert("name".into(), json!(name));
                out.insert("valu".into(), json!(valu));
            }
            StormError::AuthDeny { user, perm } => {
                out.insert("user".into(), json!(user));
                out.insert("perm".into(), json!(perm));
            }
            _ => {}
        }
        out
    }

    /// Message without the kind prefix.
    pub fn mesg(&self) -> String {
        match self {
            StormError::Runtime { mesg, .. } => mesg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for StormError {
    fn from(err: std::io::Error) -> Self {
        StormError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for StormError {
    fn from(err: rusqlite::Error) -> Self {
        StormError::Spool(err.to_string())
    }
}

impl From<serde_json::Error> for StormError {
    fn from(err: serde_json::Error) -> Self {
        StormError::Spool(format!("encoding: {err}"))
    }
}

impl From<toml::de::Error> for StormError {
    fn from(err: toml::de::Error) -> Self {
        StormError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_carry_context() {
        let err = StormError::runtime("pprint() missing arguments")
            .with("name", "pprint")
            .with("expected", 3)
            .with("got", 2);
        assert_eq!(err.code(), "StormRuntimeError");
        let info = err.info();
        assert_eq!(info["name"], json!("pprint"));
        assert_eq!(info["expected"], json!(3));
        assert_eq!(info["got"], json!(2));
        assert_eq!(info["mesg"], json!("pprint() missing arguments"));
    }

    #[test]
    fn schema_errors_name_the_entity() {
        let err = StormError::NoSuchProp {
            name: "test:str:newp".into(),
        };
        assert_eq!(err.code(), "NoSuchProp");
        assert_eq!(err.info()["name"], json!("test:str:newp"));
    }

    #[test]
    fn with_ignores_non_runtime_kinds() {
        let err = StormError::Cancelled.with("name", "x");
        assert_eq!(err, StormError::Cancelled);
    }
}
