//! # Payload Values
//!
//! The dynamic value model carried in packet payloads, and its translation to the
//! `netpack` wire format. Engine types travel as typed extension blocks.
//!
//! `Interface` and `Context` are local-only: the marshaller rewrites them into
//! `Reference`/`Definition` before a value is encoded.

use std::collections::BTreeMap;
use std::sync::Arc;

use netpack::Decoder;
use netpack::Encoder;
use netpack::Tag;

use crate::context::Context;
use crate::context::same_instance;
use crate::error::ErrorKind;
use crate::error::RemoteError;
use crate::interface::Interface;
use crate::wire::Result;
use crate::wire::WireError;
use crate::wire::definition::Definition;
use crate::wire::definition::Definitions;
use crate::wire::definition::Reference;
use crate::wire::definition::decode_definition;
use crate::wire::definition::decode_definition_body;
use crate::wire::definition::encode_definition;

/// The maximum nesting depth for values before the codec gives up.
pub const MAX_DEPTH: usize = 64;

/// Extension type ids registered by the engine.
pub(crate) mod ext {
    pub const DEFINITION: u8 = 1;
    pub const REFERENCE: u8 = 2;
    pub const DEFINITIONS: u8 = 3;
    pub const ERROR: u8 = 4;
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Definition(Definition),
    Reference(Reference),
    Definitions(Definitions),
    Error(RemoteError),
    Interface(Interface),
    Context(Arc<dyn Context>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Definition(_) => "definition",
            Self::Reference(_) => "reference",
            Self::Definitions(_) => "definitions",
            Self::Error(_) => "error",
            Self::Interface(_) => "interface",
            Self::Context(_) => "context",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<&Interface> {
        match self {
            Self::Interface(iface) => Some(iface),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_interface(self) -> Option<Interface> {
        match self {
            Self::Interface(iface) => Some(iface),
            _ => None,
        }
    }

    /// Builds a map value from string keys.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Definition(a), Self::Definition(b)) => a == b,
            (Self::Reference(a), Self::Reference(b)) => a == b,
            (Self::Definitions(a), Self::Definitions(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            (Self::Interface(a), Self::Interface(b)) => a.same(b),
            (Self::Context(a), Self::Context(b)) => same_instance(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<Definition> for Value {
    fn from(v: Definition) -> Self {
        Self::Definition(v)
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Self::Reference(v)
    }
}

impl From<Definitions> for Value {
    fn from(v: Definitions) -> Self {
        Self::Definitions(v)
    }
}

impl From<RemoteError> for Value {
    fn from(v: RemoteError) -> Self {
        Self::Error(v)
    }
}

impl From<Interface> for Value {
    fn from(v: Interface) -> Self {
        Self::Interface(v)
    }
}

impl From<Arc<dyn Context>> for Value {
    fn from(v: Arc<dyn Context>) -> Self {
        Self::Context(v)
    }
}

/// Encodes a value into the encoder stream.
///
/// # Errors
/// `DepthLimit` past `MAX_DEPTH`, `UnsupportedValue` for unmarshalled local objects.
pub fn encode_value(enc: &mut Encoder, val: &Value) -> Result<()> {
    encode_value_at(enc, val, 0)
}

pub(crate) fn encode_value_at(enc: &mut Encoder, val: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(WireError::DepthLimit);
    }

    match val {
        Value::Null => enc.null()?,
        Value::Bool(b) => enc.bool(*b)?,
        Value::Int(v) => enc.s64(*v)?,
        Value::Float(v) => enc.f64(*v)?,
        Value::Str(v) => enc.str(v)?,
        Value::Bytes(v) => enc.bytes(v)?,
        Value::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value_at(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
        Value::Map(entries) => {
            enc.map_begin()?;
            for (key, item) in entries {
                enc.entry_begin(key)?;
                encode_value_at(enc, item, depth + 1)?;
                enc.entry_end()?;
            }
            enc.map_end()?;
        }
        Value::Definition(def) => encode_definition(enc, def, depth)?,
        Value::Reference(reference) => {
            enc.ext_begin(ext::REFERENCE)?;
            enc.u32(reference.def_id)?;
            enc.ext_end()?;
        }
        Value::Definitions(defs) => {
            let count = u32::try_from(defs.len())
                .map_err(|_| WireError::ProtocolViolation("too many definitions".into()))?;
            enc.ext_begin(ext::DEFINITIONS)?;
            enc.u32(count)?;
            for def in defs {
                encode_definition(enc, def, depth + 1)?;
            }
            enc.ext_end()?;
        }
        Value::Error(err) => {
            enc.ext_begin(ext::ERROR)?;
            enc.str(err.kind.as_tag())?;
            enc.str(&err.message)?;
            enc.ext_end()?;
        }
        Value::Interface(_) | Value::Context(_) => {
            return Err(WireError::UnsupportedValue(val.kind_name()));
        }
    }
    Ok(())
}

/// Decodes one value from the decoder stream.
pub fn decode_value(dec: &mut Decoder) -> Result<Value> {
    decode_value_at(dec, 0)
}

pub(crate) fn decode_value_at(dec: &mut Decoder, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(WireError::DepthLimit);
    }

    let value = match dec.peek_tag()? {
        Tag::Null => {
            dec.null()?;
            Value::Null
        }
        Tag::BoolTrue | Tag::BoolFalse => Value::Bool(dec.bool()?),
        Tag::U32 => Value::Int(dec.u32()? as i64),
        Tag::S64 => Value::Int(dec.s64()?),
        Tag::F64 => Value::Float(dec.f64()?),
        Tag::String => Value::Str(dec.str()?.to_string()),
        Tag::Bytes => Value::Bytes(dec.bytes()?.to_vec()),
        Tag::List => {
            let mut items = Vec::new();
            let mut iter = dec.list()?;
            while let Some(mut item) = iter.next()? {
                items.push(decode_value_at(&mut item, depth + 1)?);
            }
            Value::List(items)
        }
        Tag::Map => {
            let mut entries = BTreeMap::new();
            let mut iter = dec.map()?;
            while let Some((key, mut item)) = iter.next()? {
                entries.insert(key.to_string(), decode_value_at(&mut item, depth + 1)?);
            }
            Value::Map(entries)
        }
        Tag::Entry => {
            return Err(WireError::ProtocolViolation("map entry outside of a map".into()));
        }
        Tag::Ext => {
            let (ty, mut body) = dec.ext()?;
            match ty {
                ext::DEFINITION => Value::Definition(decode_definition_body(&mut body, depth)?),
                ext::REFERENCE => Value::Reference(Reference::new(body.u32()?)),
                ext::DEFINITIONS => {
                    let count = body.u32()?;
                    let mut defs = Definitions::new();
                    for _ in 0..count {
                        defs.push(decode_definition(&mut body, depth + 1)?);
                    }
                    Value::Definitions(defs)
                }
                ext::ERROR => {
                    let kind = ErrorKind::from_tag(body.str()?);
                    let message = body.str()?.to_string();
                    Value::Error(RemoteError::new(kind, message))
                }
                other => return Err(WireError::UnknownExtension(other)),
            }
        }
    };
    Ok(value)
}

/// Encodes a single value into a fresh buffer.
pub fn encode_to_bytes(val: &Value) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_value(&mut enc, val)?;
    Ok(enc.into_bytes()?)
}

/// Decodes a single value from a buffer, rejecting trailing bytes.
pub fn decode_from_bytes(bytes: &[u8]) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let value = decode_value(&mut dec)?;
    if dec.remaining() != 0 {
        return Err(WireError::ProtocolViolation("trailing bytes after value".into()));
    }
    Ok(value)
}
