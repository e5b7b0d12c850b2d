//! # Netpack
//!
//! A small, bounded TLV encoding used for every netron packet.
//!
//! ## Philosophy
//!
//! - **Explicit State**: The encoder tracks open scopes on a stack and back-patches lengths.
//! - **TLV Architecture**: `[Tag][Length?][Value]` lets a reader skip anything it does not know.
//! - **Bounded**: Decoders are zero-copy, bounds-checked views over a borrowed slice.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//! - **Extensions**: `[Tag: 1b][Len: 4b][Type: 1b][Body: Len - 1]`
//!
//! All integers are Little-Endian.


/// Netpack encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`.
    #[error("invalid tag byte: {0:#04x}")]
    InvalidTag(u8),
    /// String data is not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    /// Closing a scope that does not match the active scope.
    #[error("scope mismatch: expected {expected:?}, found {actual:?}")]
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the root remains.
    #[error("scope underflow")]
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    #[error("scope still open")]
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    #[error("unexpected end of buffer")]
    UnexpectedEnd,
    /// Blob or container length exceeds `u32::MAX`.
    #[error("blob too large: {0} bytes")]
    BlobTooLarge(usize),
    /// A map entry must hold exactly one value.
    #[error("map entry must hold exactly one value")]
    EntryArity,
    /// Only entries may be written directly into a map.
    #[error("only entries may be written into a map")]
    InvalidMapEntry,
}

/// Specialized `Result` for netpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of the encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Null = 0x00,
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U32 = 0x05,
    S64 = 0x0A,
    F64 = 0x0C,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,
    Entry = 0x22,

    // Typed extension (Tag + u32 Len + u8 Type + Body)
    Ext = 0x40,
}

impl Tag {
    /// Returns the Tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Tag::Null),
            0x01 => Some(Tag::BoolTrue),
            0x02 => Some(Tag::BoolFalse),
            0x05 => Some(Tag::U32),
            0x0A => Some(Tag::S64),
            0x0C => Some(Tag::F64),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x22 => Some(Tag::Entry),
            0x40 => Some(Tag::Ext),
            _ => None,
        }
    }
}

/// Open scope kinds tracked by the `Encoder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any item.
    Root,
    /// Ordered sequence of any number of items.
    List,
    /// Key-value container; only `Tag::Entry` items.
    Map,
    /// Exactly one value after the key.
    Entry,
    /// Typed extension body; any number of items.
    Ext,
}

struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A state-machine driven encoder.
///
/// Every write is validated against the innermost open scope:
///
/// 1.  **Map**: only `entry_begin()` may be used.
/// 2.  **Entry**: exactly one value must follow the key.
/// 3.  **Root**: the encoder must be back at the root to finalize bytes.
pub struct Encoder {
    buf: Vec<u8>,
    /// Bottom is always `Scope::Root`.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new encoder.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            stack: vec![Frame { start: 0, scope: Scope::Root, count: 0 }],
        }
    }

    /// Consumes the encoder and returns the final bytes.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a container was left open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn current_frame(&mut self) -> &mut Frame {
        let top = self.stack.len() - 1;
        &mut self.stack[top]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current_frame();
        match frame.scope {
            Scope::Root | Scope::List | Scope::Ext => Ok(()),
            Scope::Map if tag == Tag::Entry => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            Scope::Entry if frame.count >= 1 => Err(Error::EntryArity),
            Scope::Entry => Ok(()),
        }
    }

    fn on_item_written(&mut self) {
        self.current_frame().count += 1;
    }

    fn write_tag(&mut self, tag: Tag) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        Ok(())
    }

    fn write_blob(&mut self, tag: Tag, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        if len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(len));
        }
        self.write_tag(tag)?;
        self.buf.extend_from_slice(&(len as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self.on_item_written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.write_tag(tag)?;
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // length placeholder
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }

        let frame = self.current_frame();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if frame.scope == Scope::Entry && frame.count != 1 {
            return Err(Error::EntryArity);
        }

        let Some(frame) = self.stack.pop() else {
            return Err(Error::ScopeUnderflow);
        };
        let body_len = self.buf.len() - frame.start;
        if body_len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(body_len));
        }
        self.buf[frame.start - 4..frame.start].copy_from_slice(&(body_len as u32).to_le_bytes());

        self.on_item_written();
        Ok(())
    }

    /// Encodes the absence of a value.
    pub fn null(&mut self) -> Result<()> {
        self.write_tag(Tag::Null)?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes a boolean.
    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.write_tag(if v { Tag::BoolTrue } else { Tag::BoolFalse })?;
        self.on_item_written();
        Ok(())
    }

    /// Encodes an unsigned 32-bit integer (LE).
    pub fn u32(&mut self, v: u32) -> Result<()> {
        self.write_tag(Tag::U32)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a signed 64-bit integer (LE).
    pub fn s64(&mut self, v: i64) -> Result<()> {
        self.write_tag(Tag::S64)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a 64-bit float (LE).
    pub fn f64(&mut self, v: f64) -> Result<()> {
        self.write_tag(Tag::F64)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.on_item_written();
        Ok(())
    }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> {
        self.write_blob(Tag::String, v.as_bytes())
    }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_blob(Tag::Bytes, v)
    }

    /// Begins a list. Must be closed with `list_end()`.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    /// Ends a list.
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a map. Only `entry_begin()` is allowed as a direct child.
    pub fn map_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Map, Scope::Map) }
    /// Ends a map.
    pub fn map_end(&mut self) -> Result<()> { self.end_scope(Scope::Map) }

    /// Begins a map entry and writes its key.
    ///
    /// Exactly one value must be written before `entry_end()`.
    pub fn entry_begin(&mut self, key: &str) -> Result<()> {
        self.begin_scope(Tag::Entry, Scope::Entry)?;
        self.str(key)?;
        // the key is not the payload
        self.current_frame().count = 0;
        Ok(())
    }
    /// Ends a map entry.
    pub fn entry_end(&mut self) -> Result<()> { self.end_scope(Scope::Entry) }

    /// Begins a typed extension block identified by `ty`.
    pub fn ext_begin(&mut self, ty: u8) -> Result<()> {
        self.begin_scope(Tag::Ext, Scope::Ext)?;
        self.buf.push(ty);
        Ok(())
    }
    /// Ends a typed extension block.
    pub fn ext_end(&mut self) -> Result<()> { self.end_scope(Scope::Ext) }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Container reads return new `Decoder`s restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Peeks the next Tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let Some(&b) = self.buf.first() else {
            return Err(Error::UnexpectedEnd);
        };
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_bytes(N)?.try_into().map_err(|_| Error::UnexpectedEnd)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn check_tag(&mut self, expected: Tag) -> Result<()> {
        let tag = self.peek_tag()?;
        if tag != expected {
            return Err(Error::InvalidTag(tag as u8));
        }
        self.read_bytes(1)?;
        Ok(())
    }

    fn enter_container(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.check_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Skips the next item and everything nested in it.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.read_bytes(1)?;
        match tag {
            Tag::Null | Tag::BoolTrue | Tag::BoolFalse => {}
            Tag::U32 => { self.read_bytes(4)?; }
            Tag::S64 | Tag::F64 => { self.read_bytes(8)?; }
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::Entry | Tag::Ext => {
                let len = self.read_len()?;
                self.read_bytes(len)?;
            }
        }
        Ok(())
    }

    /// Returns true and consumes the tag if the next item is `Null`.
    pub fn null(&mut self) -> Result<bool> {
        if self.peek_tag()? == Tag::Null {
            self.read_bytes(1)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Decodes a bool.
    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.read_bytes(1)?; Ok(true) }
            Tag::BoolFalse => { self.read_bytes(1)?; Ok(false) }
            tag => Err(Error::InvalidTag(tag as u8)),
        }
    }

    /// Decodes u32 (LE).
    pub fn u32(&mut self) -> Result<u32> {
        self.check_tag(Tag::U32)?;
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Decodes s64 (LE).
    pub fn s64(&mut self) -> Result<i64> {
        self.check_tag(Tag::S64)?;
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Decodes f64 (LE).
    pub fn f64(&mut self) -> Result<f64> {
        self.check_tag(Tag::F64)?;
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Decodes a string slice.
    pub fn str(&mut self) -> Result<&'a str> {
        self.check_tag(Tag::String)?;
        let len = self.read_len()?;
        std::str::from_utf8(self.read_bytes(len)?).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.check_tag(Tag::Bytes)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    /// Decodes a list into an iterator over its items.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter_container(Tag::List)? })
    }

    /// Decodes a map into an iterator over its entries.
    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter_container(Tag::Map)? })
    }

    /// Decodes a typed extension block.
    ///
    /// Returns `(Type, BodyDecoder)`.
    pub fn ext(&mut self) -> Result<(u8, Decoder<'a>)> {
        let mut body = self.enter_container(Tag::Ext)?;
        let [ty] = body.read_array::<1>()?;
        Ok((ty, body))
    }
}

/// Iterator over the items of a list.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a Decoder scoped to the next item, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// Iterator over the entries of a map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    /// Returns `(Key, ValueDecoder)` for the next entry, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut entry = self.dec.enter_container(Tag::Entry)?;
        let key = entry.str()?;
        Ok(Some((key, entry)))
    }
}
