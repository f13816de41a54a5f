//! BEP-3 bencoding.
//!
//! DHT messages are bencoded dictionaries. Values form a small sum type;
//! dictionary keys are kept in a `BTreeMap` so re-serialisation emits them
//! in the lexicographic order BEP 3 requires.
//!
//! Keys and strings are raw byte strings, not UTF-8: node ids and compact
//! endpoints routinely contain arbitrary bytes.

use std::collections::BTreeMap;

/// A bencoded dictionary.
pub type Dict = BTreeMap<Vec<u8>, Value>;

/// A bencoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// `i<decimal>e`
    Int(i64),
    /// `<len>:<bytes>`
    Bytes(Vec<u8>),
    /// `l...e`
    List(Vec<Value>),
    /// `d...e`, keys sorted
    Dict(Dict),
}

impl Value {
    /// Build a byte-string value.
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    /// The integer inside, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The bytes inside, if this is a `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The list inside, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// The dictionary inside, if this is a `Dict`.
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Serialise into `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(l) => {
                out.push(b'l');
                for v in l {
                    v.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(d) => {
                out.push(b'd');
                for (k, v) in d {
                    out.extend_from_slice(k.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(k);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Serialise into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Parse a single bencoded value spanning exactly `data`.
    ///
    /// Trailing bytes after the value make the parse fail, so a datagram is
    /// either one well-formed message or garbage.
    pub fn decode(data: &[u8]) -> Option<Value> {
        let mut p = Parser { data, pos: 0 };
        let v = p.value(0)?;
        if p.pos != data.len() {
            return None;
        }
        Some(v)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Nesting depth guard; real DHT messages nest three levels.
const MAX_DEPTH: usize = 32;

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> Option<Value> {
        if depth > MAX_DEPTH {
            return None;
        }
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            _ => None,
        }
    }

    fn int(&mut self) -> Option<Value> {
        self.pos += 1; // 'i'
        let end = self.find(b'e')?;
        let s = std::str::from_utf8(&self.data[self.pos..end]).ok()?;
        // Reject empty, lone '-', and leading zeros other than "0"/"-0" is
        // not canonical but tolerated on input.
        let n: i64 = s.parse().ok()?;
        self.pos = end + 1;
        Some(Value::Int(n))
    }

    fn bytes(&mut self) -> Option<Vec<u8>> {
        let colon = self.find(b':')?;
        let len_s = std::str::from_utf8(&self.data[self.pos..colon]).ok()?;
        let len: usize = len_s.parse().ok()?;
        let start = colon + 1;
        let end = start.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        self.pos = end;
        Some(self.data[start..end].to_vec())
    }

    fn list(&mut self, depth: usize) -> Option<Value> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Some(Value::List(items));
            }
            items.push(self.value(depth + 1)?);
        }
    }

    fn dict(&mut self, depth: usize) -> Option<Value> {
        self.pos += 1; // 'd'
        let mut map = Dict::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Some(Value::Dict(map));
            }
            let key = self.bytes()?;
            let val = self.value(depth + 1)?;
            // Later duplicates win; strict key-order checking would drop
            // messages from sloppy-but-common implementations.
            map.insert(key, val);
        }
    }

    fn find(&self, byte: u8) -> Option<usize> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == byte)
            .map(|i| self.pos + i)
    }
}

/// Convenience: get a byte-string field out of a dictionary.
pub fn dict_bytes<'d>(d: &'d Dict, key: &[u8]) -> Option<&'d [u8]> {
    d.get(key)?.as_bytes()
}

/// Convenience: get an integer field out of a dictionary.
pub fn dict_int(d: &Dict, key: &[u8]) -> Option<i64> {
    d.get(key)?.as_int()
}
