//! # Packet Envelope
//!
//! `[stream_id:u32, packet_id:u32, flags:u32, data]` as a four element list.

use netpack::Decoder;
use netpack::Encoder;

use crate::wire::Result;
use crate::wire::WireError;
use crate::wire::flags::Action;
use crate::wire::flags::Flags;
use crate::wire::flags::Status;
use crate::wire::value::Value;
use crate::wire::value::decode_value;
use crate::wire::value::encode_value;

/// Reserved for multi-packet streams; always 1 for now.
pub const DEFAULT_PACKET_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_id: u32,
    pub packet_id: u32,
    pub impulse: bool,
    pub status: Status,
    pub action: Action,
    pub data: Value,
}

impl Packet {
    pub fn new(stream_id: u32, impulse: bool, status: Status, action: Action, data: Value) -> Self {
        Self { stream_id, packet_id: DEFAULT_PACKET_ID, impulse, status, action, data }
    }

    pub fn flags(&self) -> Flags {
        Flags::new(self.impulse, self.status, self.action)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.list_begin()?;
        enc.u32(self.stream_id)?;
        enc.u32(self.packet_id)?;
        enc.u32(self.flags().raw())?;
        encode_value(&mut enc, &self.data)?;
        enc.list_end()?;
        Ok(enc.into_bytes()?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let mut fields = dec.list()?;
        let shape = || WireError::ProtocolViolation("packet must have exactly 4 fields".into());

        let stream_id = fields.next()?.ok_or_else(shape)?.u32()?;
        let packet_id = fields.next()?.ok_or_else(shape)?.u32()?;
        let flags = Flags::from_raw(fields.next()?.ok_or_else(shape)?.u32()?);
        let status = flags.validate()?;
        let data = decode_value(&mut fields.next()?.ok_or_else(shape)?)?;

        if fields.next()?.is_some() || dec.remaining() != 0 {
            return Err(shape());
        }

        Ok(Self {
            stream_id,
            packet_id,
            impulse: flags.impulse(),
            status,
            action: flags.action(),
            data,
        })
    }
}
