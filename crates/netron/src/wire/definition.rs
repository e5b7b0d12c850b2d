//! Identity types for remotely reachable objects and their typed encoders.
//!
//! A `Definition` is written as ext block `ext::DEFINITION` holding
//! `id:u32, parent_id:u32` followed by description, metadata and twin
//! through the generic value encoder. Metadata is a list of
//! `[name, method, readonly]` triples so member order survives the trip.

use std::collections::BTreeMap;

use netpack::Decoder;
use netpack::Encoder;

use crate::wire::Result;
use crate::wire::WireError;
use crate::wire::value::Value;
use crate::wire::value::decode_value_at;
use crate::wire::value::encode_value_at;
use crate::wire::value::ext;

pub type DefinitionId = u32;

/// Parent id of a top-level context. Real ids start at 1.
pub const ROOT_PARENT: DefinitionId = 0;

/// Per-member descriptor enumerated once when a stub is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberMeta {
    pub method: bool,
    pub readonly: bool,
}

impl MemberMeta {
    pub fn method() -> Self {
        Self { method: true, readonly: false }
    }

    pub fn property() -> Self {
        Self { method: false, readonly: false }
    }

    pub fn readonly() -> Self {
        Self { method: false, readonly: true }
    }
}

/// Override source shipped alongside a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwinSource {
    Inline(String),
    Node(String),
}

impl TwinSource {
    pub fn source(&self) -> &str {
        match self {
            Self::Inline(src) | Self::Node(src) => src,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub id: DefinitionId,
    pub parent_id: DefinitionId,
    pub name: String,
    pub description: Option<String>,
    pub members: Vec<(String, MemberMeta)>,
    pub twin: Option<TwinSource>,
    /// Owning peer, set when the definition is handed to one peer. Never on the wire.
    pub uid: Option<String>,
}

impl Definition {
    pub fn member(&self, name: &str) -> Option<MemberMeta> {
        self.members.iter().find(|(member, _)| member == name).map(|(_, meta)| *meta)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id == ROOT_PARENT
    }
}

/// By-id pointer to a definition that already exists on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    pub def_id: DefinitionId,
}

impl Reference {
    pub fn new(def_id: DefinitionId) -> Self {
        Self { def_id }
    }
}

/// Insertion-ordered collection of definitions, returned for collections of remote objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Definitions(Vec<Definition>);

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, def: Definition) {
        self.0.push(def);
    }

    pub fn get(&self, index: usize) -> Option<&Definition> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Definition> {
        self.0.iter()
    }
}

impl From<Vec<Definition>> for Definitions {
    fn from(defs: Vec<Definition>) -> Self {
        Self(defs)
    }
}

impl IntoIterator for Definitions {
    type Item = Definition;
    type IntoIter = std::vec::IntoIter<Definition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Definitions {
    type Item = &'a Definition;
    type IntoIter = std::slice::Iter<'a, Definition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

pub(crate) fn encode_definition(enc: &mut Encoder, def: &Definition, depth: usize) -> Result<()> {
    enc.ext_begin(ext::DEFINITION)?;
    enc.u32(def.id)?;
    enc.u32(def.parent_id)?;
    encode_value_at(enc, &Value::Str(def.name.clone()), depth + 1)?;

    let description = match &def.description {
        Some(text) => Value::Str(text.clone()),
        None => Value::Null,
    };
    encode_value_at(enc, &description, depth + 1)?;

    let metadata = def
        .members
        .iter()
        .map(|(name, meta)| {
            Value::List(vec![
                Value::Str(name.clone()),
                Value::Bool(meta.method),
                Value::Bool(meta.readonly),
            ])
        })
        .collect();
    encode_value_at(enc, &Value::List(metadata), depth + 1)?;

    let twin = match &def.twin {
        None => Value::Null,
        Some(TwinSource::Inline(src)) => Value::Str(src.clone()),
        Some(TwinSource::Node(src)) => {
            Value::Map(BTreeMap::from([("node".to_string(), Value::Str(src.clone()))]))
        }
    };
    encode_value_at(enc, &twin, depth + 1)?;
    enc.ext_end()?;
    Ok(())
}

fn violation(what: &str) -> WireError {
    WireError::ProtocolViolation(format!("definition {what}"))
}

/// Decodes the body of a definition ext block (type byte already consumed).
pub(crate) fn decode_definition_body(body: &mut Decoder, depth: usize) -> Result<Definition> {
    let id = body.u32()?;
    let parent_id = body.u32()?;

    let Value::Str(name) = decode_value_at(body, depth + 1)? else {
        return Err(violation("name must be a string"));
    };

    let description = match decode_value_at(body, depth + 1)? {
        Value::Null => None,
        Value::Str(text) => Some(text),
        _ => return Err(violation("description must be a string or null")),
    };

    let Value::List(entries) = decode_value_at(body, depth + 1)? else {
        return Err(violation("metadata must be a list"));
    };
    let mut members = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::List(triple) => match triple.as_slice() {
                [Value::Str(name), Value::Bool(method), Value::Bool(readonly)] => {
                    members.push((name.clone(), MemberMeta { method: *method, readonly: *readonly }));
                }
                _ => return Err(violation("member must be [name, method, readonly]")),
            },
            _ => return Err(violation("member must be a list")),
        }
    }

    let twin = match decode_value_at(body, depth + 1)? {
        Value::Null => None,
        Value::Str(src) => Some(TwinSource::Inline(src)),
        Value::Map(mut map) => match map.remove("node") {
            Some(Value::Str(src)) => Some(TwinSource::Node(src)),
            _ => return Err(violation("twin map must carry a node source")),
        },
        _ => return Err(violation("twin must be a string, a map or null")),
    };

    if body.remaining() != 0 {
        return Err(violation("has trailing bytes"));
    }

    Ok(Definition { id, parent_id, name, description, members, twin, uid: None })
}

pub(crate) fn decode_definition(dec: &mut Decoder, depth: usize) -> Result<Definition> {
    let (ty, mut body) = dec.ext()?;
    if ty != ext::DEFINITION {
        return Err(WireError::UnknownExtension(ty));
    }
    decode_definition_body(&mut body, depth)
}
