//! Immutable primitive values as the graph stores them.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StormError};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;

/// Normalized primitive held by nodes, sets and spooled collections.
///
/// `Prim` is totally ordered and hashable; floats compare by `f64::total_cmp`
/// and hash by their bit pattern.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Prim {
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
    /// Ordered sequence (comp values, arrays, ndefs, intervals).
    List(Vec<Prim>),
}

impl Prim {
    fn rank(&self) -> u8 {
        match self {
            Prim::Null => 0,
            Prim::Bool(_) => 1,
            Prim::Int(_) => 2,
            Prim::Float(_) => 3,
            Prim::Str(_) => 4,
            Prim::Bytes(_) => 5,
            Prim::List(_) => 6,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Prim::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Prim::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the list payload, if any.
    pub fn as_list(&self) -> Option<&[Prim]> {
        match self {
            Prim::List(items) => Some(items),
            _ => None,
        }
    }

    /// Stable byte encoding used as a disk key.
    ///
    /// Two prims encode to the same bytes exactly when they compare equal.
    /// Floats are written by bit pattern, so every NaN payload and both
    /// infinities keep distinct keys.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        buf
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Prim::Null => buf.push(TAG_NULL),
            Prim::Bool(v) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*v));
            }
            Prim::Int(v) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Prim::Float(v) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Prim::Str(v) => {
                buf.push(TAG_STR);
                write_len(buf, v.len());
                buf.extend_from_slice(v.as_bytes());
            }
            Prim::Bytes(v) => {
                buf.push(TAG_BYTES);
                write_len(buf, v.len());
                buf.extend_from_slice(v);
            }
            Prim::List(items) => {
                buf.push(TAG_LIST);
                write_len(buf, items.len());
                for item in items {
                    item.write(buf);
                }
            }
        }
    }

    /// Inverse of [`Prim::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Prim> {
        let mut reader = Reader { bytes, pos: 0 };
        let prim = reader.prim()?;
        if reader.pos != bytes.len() {
            return Err(corrupt("trailing bytes after value"));
        }
        Ok(prim)
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u64).to_le_bytes());
}

fn corrupt(mesg: &str) -> StormError {
    StormError::Spool(format!("corrupt key: {mesg}"))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corrupt("unexpected end of key"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn word(&mut self) -> Result<[u8; 8]> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.take(8)?);
        Ok(word)
    }

    fn len(&mut self) -> Result<usize> {
        usize::try_from(u64::from_le_bytes(self.word()?)).map_err(|_| corrupt("length overflow"))
    }

    fn prim(&mut self) -> Result<Prim> {
        let tag = self.take(1)?[0];
        Ok(match tag {
            TAG_NULL => Prim::Null,
            TAG_BOOL => Prim::Bool(self.take(1)?[0] != 0),
            TAG_INT => Prim::Int(i64::from_le_bytes(self.word()?)),
            TAG_FLOAT => Prim::Float(f64::from_bits(u64::from_le_bytes(self.word()?))),
            TAG_STR => {
                let len = self.len()?;
                let text = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| corrupt("string is not utf-8"))?;
                Prim::Str(text.to_owned())
            }
            TAG_BYTES => {
                let len = self.len()?;
                Prim::Bytes(self.take(len)?.to_vec())
            }
            TAG_LIST => {
                let count = self.len()?;
                let mut items = Vec::with_capacity(count.min(self.bytes.len()));
                for _ in 0..count {
                    items.push(self.prim()?);
                }
                Prim::List(items)
            }
            other => return Err(corrupt(&format!("unknown tag {other:#04x}"))),
        })
    }
}

impl PartialEq for Prim {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Prim {}

impl PartialOrd for Prim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prim {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Prim::Null, Prim::Null) => Ordering::Equal,
            (Prim::Bool(a), Prim::Bool(b)) => a.cmp(b),
            (Prim::Int(a), Prim::Int(b)) => a.cmp(b),
            (Prim::Float(a), Prim::Float(b)) => a.total_cmp(b),
            (Prim::Str(a), Prim::Str(b)) => a.cmp(b),
            (Prim::Bytes(a), Prim::Bytes(b)) => a.cmp(b),
            (Prim::List(a), Prim::List(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Prim {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Prim::Null => {}
            Prim::Bool(v) => v.hash(state),
            Prim::Int(v) => v.hash(state),
            Prim::Float(v) => v.to_bits().hash(state),
            Prim::Str(v) => v.hash(state),
            Prim::Bytes(v) => v.hash(state),
            Prim::List(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prim::Null => write!(f, "null"),
            Prim::Bool(v) => write!(f, "{v}"),
            Prim::Int(v) => write!(f, "{v}"),
            Prim::Float(v) => write!(f, "{v}"),
            Prim::Str(v) => write!(f, "{v}"),
            Prim::Bytes(v) => write!(f, "{}", hex::encode(v)),
            Prim::List(items) => {
                write!(f, "(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<&str> for Prim {
    fn from(value: &str) -> Self {
        Prim::Str(value.to_owned())
    }
}

impl From<String> for Prim {
    fn from(value: String) -> Self {
        Prim::Str(value)
    }
}

impl From<i64> for Prim {
    fn from(value: i64) -> Self {
        Prim::Int(value)
    }
}

impl From<bool> for Prim {
    fn from(value: bool) -> Self {
        Prim::Bool(value)
    }
}
