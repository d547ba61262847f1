//! Value normalization and comparator evaluation per base type.

use xxhash_rust::xxh64::xxh64;

use super::time::{parse_time, TIME_MAX};
use super::{Base, Model, TypeDef};
use crate::error::{Result, StormError};
use crate::prim::Prim;

/// Interval semantics for `@=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapKind {
    /// Node value is a single time.
    Time,
    /// Node value is a `(min, max)` interval.
    Ival,
}

/// Comparator with a normalized operand, ready to test stored values.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// `=`
    Eq(Prim),
    /// `!=`
    Ne(Prim),
    /// `<`
    Lt(Prim),
    /// `<=`
    Le(Prim),
    /// `>`
    Gt(Prim),
    /// `>=`
    Ge(Prim),
    /// `^=`
    Prefix(String),
    /// `range=` (inclusive).
    Range(Prim, Prim),
    /// `in=`
    In(Vec<Prim>),
    /// `@=`
    Overlap {
        /// Interval minimum.
        min: i64,
        /// Interval maximum (exclusive).
        max: i64,
        /// How stored values are read.
        kind: OverlapKind,
    },
}

impl Matcher {
    /// Tests a stored, already normalized value.
    pub fn matches(&self, have: &Prim) -> bool {
        match self {
            Matcher::Eq(want) => have == want,
            Matcher::Ne(want) => have != want,
            Matcher::Lt(want) => have < want,
            Matcher::Le(want) => have <= want,
            Matcher::Gt(want) => have > want,
            Matcher::Ge(want) => have >= want,
            Matcher::Prefix(prefix) => match have {
                Prim::Str(text) => text.starts_with(prefix.as_str()),
                _ => false,
            },
            Matcher::Range(low, high) => have >= low && have <= high,
            Matcher::In(items) => items.contains(have),
            Matcher::Overlap { min, max, kind } => match (kind, have) {
                (OverlapKind::Time, Prim::Int(tick)) => tick >= min && tick < max,
                (OverlapKind::Ival, Prim::List(pair)) => match pair.as_slice() {
                    [Prim::Int(lo), Prim::Int(hi)] => lo < max && hi > min,
                    _ => false,
                },
                _ => false,
            },
        }
    }
}

fn supports(base: Base, cmpr: &str) -> bool {
    match base {
        Base::Str => matches!(cmpr, "=" | "!=" | "^=" | "in=" | "<" | "<=" | ">" | ">=" | "range="),
        Base::Int => matches!(cmpr, "=" | "!=" | "<" | "<=" | ">" | ">=" | "range=" | "in="),
        Base::Time => matches!(cmpr, "=" | "!=" | "<" | "<=" | ">" | ">=" | "range=" | "in=" | "@="),
        Base::Ival => matches!(cmpr, "=" | "!=" | "@="),
        Base::Bool => matches!(cmpr, "=" | "!="),
        Base::Guid | Base::Comp | Base::Ndef => matches!(cmpr, "=" | "!=" | "in="),
        Base::Array => matches!(cmpr, "=" | "!="),
    }
}

impl Model {
    /// Normalizes `valu` for type `ty`.
    pub fn norm(&self, ty: &str, valu: &Prim) -> Result<Prim> {
        let def = self.req_type(ty)?;
        self.norm_def(def, valu)
    }

    fn norm_def(&self, def: &TypeDef, valu: &Prim) -> Result<Prim> {
        let name = def.name.as_str();
        match def.base {
            Base::Str => match valu {
                Prim::Str(text) if def.opts.lower => Ok(Prim::Str(text.to_lowercase())),
                Prim::Str(text) => Ok(Prim::Str(text.clone())),
                Prim::Int(num) => Ok(Prim::Str(num.to_string())),
                _ => Err(StormError::bad_valu(name, valu, "expected a string")),
            },
            Base::Int => {
                let num = match valu {
                    Prim::Int(num) => *num,
                    Prim::Bool(flag) => i64::from(*flag),
                    Prim::Str(text) => parse_int(text)
                        .ok_or_else(|| StormError::bad_valu(name, valu, "invalid integer"))?,
                    _ => return Err(StormError::bad_valu(name, valu, "expected an integer")),
                };
                if def.opts.min.is_some_and(|min| num < min) {
                    return Err(StormError::bad_valu(name, valu, "integer below minimum"));
                }
                if def.opts.max.is_some_and(|max| num > max) {
                    return Err(StormError::bad_valu(name, valu, "integer above maximum"));
                }
                Ok(Prim::Int(num))
            }
            Base::Bool => match valu {
                Prim::Bool(flag) => Ok(Prim::Bool(*flag)),
                Prim::Int(num) => Ok(Prim::Bool(*num != 0)),
                Prim::Str(text) => match text.to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Prim::Bool(true)),
                    "false" | "0" | "no" => Ok(Prim::Bool(false)),
                    _ => Err(StormError::bad_valu(name, valu, "invalid boolean")),
                },
                _ => Err(StormError::bad_valu(name, valu, "expected a boolean")),
            },
            Base::Time => norm_time(name, valu).map(Prim::Int),
            Base::Ival => {
                let (min, max) = norm_ival(name, valu)?;
                Ok(Prim::List(vec![Prim::Int(min), Prim::Int(max)]))
            }
            Base::Guid => match valu {
                Prim::Str(text) if text == "*" => {
                    Ok(Prim::Str(hex::encode(rand::random::<[u8; 16]>())))
                }
                Prim::Str(text) => {
                    let lower = text.to_ascii_lowercase();
                    if lower.len() == 32 && lower.bytes().all(|b| b.is_ascii_hexdigit()) {
                        Ok(Prim::Str(lower))
                    } else {
                        Err(StormError::bad_valu(name, valu, "guid must be 32 hex characters"))
                    }
                }
                Prim::List(_) => {
                    let bytes = valu.encode();
                    Ok(Prim::Str(format!(
                        "{:016x}{:016x}",
                        xxh64(&bytes, 0),
                        xxh64(&bytes, 1)
                    )))
                }
                _ => Err(StormError::bad_valu(name, valu, "expected a guid")),
            },
            Base::Comp => {
                let Prim::List(items) = valu else {
                    return Err(StormError::bad_valu(name, valu, "comp requires a list"));
                };
                if items.len() != def.opts.fields.len() {
                    return Err(StormError::bad_valu(
                        name,
                        valu,
                        format!("comp requires {} fields", def.opts.fields.len()),
                    ));
                }
                let mut out = Vec::with_capacity(items.len());
                for ((_, ty), item) in def.opts.fields.iter().zip(items) {
                    out.push(self.norm(ty, item)?);
                }
                Ok(Prim::List(out))
            }
            Base::Array => {
                let Prim::List(items) = valu else {
                    return Err(StormError::bad_valu(name, valu, "array requires a list"));
                };
                let Some(elem) = def.opts.elem.as_deref() else {
                    return Err(StormError::BadTypeDef {
                        name: name.into(),
                        mesg: "array type requires an element type".into(),
                    });
                };
                items
                    .iter()
                    .map(|item| self.norm(elem, item))
                    .collect::<Result<Vec<_>>>()
                    .map(Prim::List)
            }
            Base::Ndef => {
                let Some([Prim::Str(form), inner]) = valu.as_list() else {
                    return Err(StormError::bad_valu(name, valu, "ndef requires (form, value)"));
                };
                self.req_form(form)?;
                let inner = self.norm(form, inner)?;
                Ok(Prim::List(vec![Prim::Str(form.clone()), inner]))
            }
        }
    }

    /// Builds a matcher for comparing stored values of `ty` against `want`.
    pub fn matcher(&self, ty: &str, cmpr: &str, want: &Prim) -> Result<Matcher> {
        let def = self.req_type(ty)?;
        if !supports(def.base, cmpr) {
            return Err(StormError::NoSuchCmpr {
                cmpr: cmpr.into(),
                name: ty.into(),
            });
        }
        let norm = |valu: &Prim| self.norm_def(def, valu);
        Ok(match cmpr {
            "=" => Matcher::Eq(norm(want)?),
            "!=" => Matcher::Ne(norm(want)?),
            "<" => Matcher::Lt(norm(want)?),
            "<=" => Matcher::Le(norm(want)?),
            ">" => Matcher::Gt(norm(want)?),
            ">=" => Matcher::Ge(norm(want)?),
            "^=" => match want {
                Prim::Str(text) if def.opts.lower => Matcher::Prefix(text.to_lowercase()),
                Prim::Str(text) => Matcher::Prefix(text.clone()),
                _ => return Err(StormError::bad_valu(ty, want, "prefix requires a string")),
            },
            "range=" => match want.as_list() {
                Some([low, high]) => Matcher::Range(norm(low)?, norm(high)?),
                _ => return Err(StormError::bad_valu(ty, want, "range requires (min, max)")),
            },
            "in=" => match want.as_list() {
                Some(items) => Matcher::In(items.iter().map(norm).collect::<Result<_>>()?),
                None => return Err(StormError::bad_valu(ty, want, "in= requires a list")),
            },
            "@=" => {
                let (min, max) = norm_ival(ty, want)?;
                let kind = match def.base {
                    Base::Ival => OverlapKind::Ival,
                    _ => OverlapKind::Time,
                };
                Matcher::Overlap { min, max, kind }
            }
            _ => {
                return Err(StormError::NoSuchCmpr {
                    cmpr: cmpr.into(),
                    name: ty.into(),
                })
            }
        })
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    match text.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn norm_time(name: &str, valu: &Prim) -> Result<i64> {
    match valu {
        Prim::Int(tick) => Ok(*tick),
        Prim::Str(text) => {
            parse_time(text).ok_or_else(|| StormError::bad_valu(name, valu, "unrecognized time"))
        }
        _ => Err(StormError::bad_valu(name, valu, "expected a time")),
    }
}

fn norm_ival(name: &str, valu: &Prim) -> Result<(i64, i64)> {
    match valu {
        Prim::List(items) => {
            let mut ticks = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Prim::Str(text) if text == "?" => ticks.push(TIME_MAX),
                    other => ticks.push(norm_time(name, other)?),
                }
            }
            match ticks.as_slice() {
                [tick] => Ok((*tick, tick.saturating_add(1))),
                [a, b] => Ok((*a.min(b), *a.max(b))),
                _ => Err(StormError::bad_valu(name, valu, "interval requires one or two times")),
            }
        }
        other => {
            let tick = norm_time(name, other)?;
            Ok((tick, tick.saturating_add(1)))
        }
    }
}
