//! # Value - structured test data
//!
//! The closed set of shapes a test record is made of: maps, sequences, sets,
//! strings, integers, floats, booleans, nil, and references to other blocks
//! in the same store file.
//!
//! `Value` has a total order (variant rank first, then contents; floats by
//! [`f64::total_cmp`]) so any value can be a set member or a map key.
//!
//! ## Binary Encoding
//!
//! Every value starts with a one-byte tag. All integers are little-endian.
//!
//! ```text
//! 0x00 nil
//! 0x01 false            0x02 true
//! 0x03 int      [i64]
//! 0x04 float    [f64 bits: u64]
//! 0x05 string   [len: u32][utf-8 bytes]
//! 0x06 seq      [count: u32][value...]
//! 0x07 set      [count: u32][value...]          (ascending order)
//! 0x08 map      [count: u32][key value ...]     (ascending key order)
//! 0x09 blockref [block id: u64]
//! ```
//!
//! ## Example
//!
//! ```rust
//! use value::Value;
//!
//! let v = Value::map([
//!     ("foo", Value::from(2)),
//!     ("bar", Value::seq(["cat".into(), Value::set(["mew"])])),
//! ]);
//! let bytes = v.to_bytes().unwrap();
//! assert_eq!(Value::from_bytes(&bytes).unwrap(), v);
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};

use thiserror::Error;

const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_SEQ: u8 = 0x06;
const TAG_SET: u8 = 0x07;
const TAG_MAP: u8 = 0x08;
const TAG_BLOCK_REF: u8 = 0x09;

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 512;
/// Maximum string length accepted by the decoder (64 MiB).
pub const MAX_STR_BYTES: u64 = 64 * 1024 * 1024;
/// Maximum element count of a single collection accepted by the decoder.
pub const MAX_ITEMS: u64 = 64 * 1024 * 1024;

/// Collections never preallocate more than this many slots from an
/// untrusted length prefix.
const PREALLOC_LIMIT: usize = 1024;

/// Errors produced while decoding a [`Value`].
#[derive(Debug, Error)]
pub enum ValueError {
    /// Underlying I/O failure, including truncated input (`UnexpectedEof`).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown value tag {0:#04x}")]
    UnknownTag(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("value nesting exceeds maximum depth {0}")]
    TooDeep(usize),

    #[error("{what} length {len} exceeds maximum {max}")]
    TooLarge {
        what: &'static str,
        len: u64,
        max: u64,
    },

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

/// A structured value stored in a test file.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Set(BTreeSet<Value>),
    Map(BTreeMap<Value, Value>),
    /// Reference to another block in the same file, by block id.
    BlockRef(u64),
}

impl Value {
    /// Builds a map from `(key, value)` pairs.
    pub fn map<K, V, I>(pairs: I) -> Value
    where
        K: Into<Value>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a sequence.
    pub fn seq<T, I>(items: I) -> Value
    where
        T: Into<Value>,
        I: IntoIterator<Item = T>,
    {
        Value::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Builds a set.
    pub fn set<T, I>(items: I) -> Value
    where
        T: Into<Value>,
        I: IntoIterator<Item = T>,
    {
        Value::Set(items.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_block_ref(&self) -> Option<u64> {
        match self {
            Value::BlockRef(id) => Some(*id),
            _ => None,
        }
    }

    /// Looks up a string key in a map value. Returns `None` for non-maps.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()
            .and_then(|m| m.get(&Value::Str(key.to_string())))
    }

    /// Appends the id of every [`Value::BlockRef`] reachable inside this
    /// value (including nested collections and map keys) to `out`.
    pub fn collect_block_refs(&self, out: &mut Vec<u64>) {
        let mut stack = vec![self];
        while let Some(v) = stack.pop() {
            match v {
                Value::BlockRef(id) => out.push(*id),
                Value::Seq(items) => stack.extend(items.iter()),
                Value::Set(items) => stack.extend(items.iter()),
                Value::Map(m) => {
                    for (k, v) in m {
                        stack.push(k);
                        stack.push(v);
                    }
                }
                _ => {}
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Seq(_) => 5,
            Value::Set(_) => 6,
            Value::Map(_) => 7,
            Value::BlockRef(_) => 8,
        }
    }

    // -------------------- Encoding --------------------

    /// Serializes this value to `w`.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Value::Nil => w.write_u8(TAG_NIL),
            Value::Bool(false) => w.write_u8(TAG_FALSE),
            Value::Bool(true) => w.write_u8(TAG_TRUE),
            Value::Int(i) => {
                w.write_u8(TAG_INT)?;
                w.write_i64::<LittleEndian>(*i)
            }
            Value::Float(f) => {
                w.write_u8(TAG_FLOAT)?;
                w.write_u64::<LittleEndian>(f.to_bits())
            }
            Value::Str(s) => {
                w.write_u8(TAG_STR)?;
                write_len(w, s.len())?;
                w.write_all(s.as_bytes())
            }
            Value::Seq(items) => {
                w.write_u8(TAG_SEQ)?;
                write_len(w, items.len())?;
                items.iter().try_for_each(|v| v.encode(w))
            }
            Value::Set(items) => {
                w.write_u8(TAG_SET)?;
                write_len(w, items.len())?;
                items.iter().try_for_each(|v| v.encode(w))
            }
            Value::Map(m) => {
                w.write_u8(TAG_MAP)?;
                write_len(w, m.len())?;
                for (k, v) in m {
                    k.encode(w)?;
                    v.encode(w)?;
                }
                Ok(())
            }
            Value::BlockRef(id) => {
                w.write_u8(TAG_BLOCK_REF)?;
                w.write_u64::<LittleEndian>(*id)
            }
        }
    }

    /// Serializes this value into a fresh buffer.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        self.encode(&mut buf)?;
        Ok(buf)
    }

    // -------------------- Decoding --------------------

    /// Reads one value from `r`.
    ///
    /// # Errors
    ///
    /// Truncated input surfaces as [`ValueError::Io`] with
    /// `UnexpectedEof`. Oversized lengths, excessive nesting, unknown tags,
    /// and invalid UTF-8 are rejected without allocating for them.
    pub fn decode<R: Read>(r: &mut R) -> Result<Value, ValueError> {
        decode_at(r, 0)
    }

    /// Decodes a value occupying exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Value, ValueError> {
        let mut rdr = bytes;
        let v = Value::decode(&mut rdr)?;
        if !rdr.is_empty() {
            return Err(ValueError::TrailingBytes(rdr.len()));
        }
        Ok(v)
    }
}

fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "value too large (length exceeds u32::MAX)",
        )
    })?;
    w.write_u32::<LittleEndian>(len)
}

fn read_len<R: Read>(r: &mut R, what: &'static str, max: u64) -> Result<u64, ValueError> {
    let len = u64::from(r.read_u32::<LittleEndian>()?);
    if len > max {
        return Err(ValueError::TooLarge { what, len, max });
    }
    Ok(len)
}

fn decode_at<R: Read>(r: &mut R, depth: usize) -> Result<Value, ValueError> {
    if depth > MAX_DEPTH {
        return Err(ValueError::TooDeep(MAX_DEPTH));
    }
    let tag = r.read_u8()?;
    let v = match tag {
        TAG_NIL => Value::Nil,
        TAG_FALSE => Value::Bool(false),
        TAG_TRUE => Value::Bool(true),
        TAG_INT => Value::Int(r.read_i64::<LittleEndian>()?),
        TAG_FLOAT => Value::Float(f64::from_bits(r.read_u64::<LittleEndian>()?)),
        TAG_STR => {
            let len = read_len(r, "string", MAX_STR_BYTES)?;
            let mut buf = Vec::new();
            r.by_ref().take(len).read_to_end(&mut buf)?;
            if (buf.len() as u64) < len {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            Value::Str(String::from_utf8(buf).map_err(|_| ValueError::InvalidUtf8)?)
        }
        TAG_SEQ => {
            let count = read_len(r, "seq", MAX_ITEMS)? as usize;
            let mut items = Vec::with_capacity(count.min(PREALLOC_LIMIT));
            for _ in 0..count {
                items.push(decode_at(r, depth + 1)?);
            }
            Value::Seq(items)
        }
        TAG_SET => {
            let count = read_len(r, "set", MAX_ITEMS)?;
            let mut items = BTreeSet::new();
            for _ in 0..count {
                items.insert(decode_at(r, depth + 1)?);
            }
            Value::Set(items)
        }
        TAG_MAP => {
            let count = read_len(r, "map", MAX_ITEMS)?;
            let mut m = BTreeMap::new();
            for _ in 0..count {
                let k = decode_at(r, depth + 1)?;
                let v = decode_at(r, depth + 1)?;
                m.insert(k, v);
            }
            Value::Map(m)
        }
        TAG_BLOCK_REF => Value::BlockRef(r.read_u64::<LittleEndian>()?),
        other => return Err(ValueError::UnknownTag(other)),
    };
    Ok(v)
}

// -------------------- Ordering, equality, hashing --------------------

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Seq(a), Value::Seq(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (Value::BlockRef(a), Value::BlockRef(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            Value::Nil => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Seq(items) => items.hash(state),
            Value::Set(items) => items.hash(state),
            Value::Map(m) => m.hash(state),
            Value::BlockRef(id) => id.hash(state),
        }
    }
}

// -------------------- Conversions --------------------

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(items)
    }
}

impl From<BTreeSet<Value>> for Value {
    fn from(items: BTreeSet<Value>) -> Self {
        Value::Set(items)
    }
}

impl From<BTreeMap<Value, Value>> for Value {
    fn from(m: BTreeMap<Value, Value>) -> Self {
        Value::Map(m)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

/// EDN-flavoured rendering, handy in logs and test failures:
/// `{"bar" ["cat" #{"mew"}], "foo" 2}`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Seq(items) => {
                write!(f, "[")?;
                write_joined(f, items.iter(), " ")?;
                write!(f, "]")
            }
            Value::Set(items) => {
                write!(f, "#{{")?;
                write_joined(f, items.iter(), " ")?;
                write!(f, "}}")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::BlockRef(id) => write!(f, "#block-ref {}", id),
        }
    }
}

fn write_joined<'a, I>(f: &mut fmt::Formatter<'_>, items: I, sep: &str) -> fmt::Result
where
    I: Iterator<Item = &'a Value>,
{
    for (i, v) in items.enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", v)?;
    }
    Ok(())
}
