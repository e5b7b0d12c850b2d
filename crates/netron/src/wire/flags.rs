//! # Flags Word
//!
//! Every packet carries one 32-bit word packing four fields:
//!
//! | bits   | field   | meaning                                    |
//! |--------|---------|--------------------------------------------|
//! | 31     | magic   | always 1, format sanity tag                |
//! | 30     | impulse | 1 = request expecting a reply, 0 = reply   |
//! | 8..15  | status  | sender's connection status at send time    |
//! | 0..7   | action  | action code                                |
//!
//! Fields are ORed in and never cleared individually.

use crate::wire::Result;
use crate::wire::WireError;

pub const MAGIC_OFFSET: u32 = 31;
pub const IMPULSE_OFFSET: u32 = 30;
pub const STATUS_OFFSET: u32 = 8;
pub const STATUS_BITS: u32 = 8;
pub const ACTION_OFFSET: u32 = 0;
pub const ACTION_BITS: u32 = 8;

/// Connection status of a peer, as tracked locally and declared on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Offline = 0,
    Connecting = 1,
    Handshaking = 2,
    Online = 3,
}

impl Status {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Offline),
            1 => Some(Self::Connecting),
            2 => Some(Self::Handshaking),
            3 => Some(Self::Online),
            _ => None,
        }
    }

    /// Sending is only permitted while handshaking or online.
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Handshaking | Self::Online)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Offline => "OFFLINE",
            Self::Connecting => "CONNECTING",
            Self::Handshaking => "HANDSHAKING",
            Self::Online => "ONLINE",
        };
        f.write_str(name)
    }
}

/// Action codes. Codes outside the known range survive as `Custom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Set,
    Get,
    Ping,
    ContextAttach,
    ContextDetach,
    EventOn,
    EventOff,
    EventEmit,
    StreamRequest,
    StreamAccept,
    StreamData,
    StreamPause,
    StreamResume,
    StreamEnd,
    Custom(u8),
}

impl Action {
    pub fn code(&self) -> u8 {
        match self {
            Self::Set => 0,
            Self::Get => 1,
            Self::Ping => 2,
            Self::ContextAttach => 3,
            Self::ContextDetach => 4,
            Self::EventOn => 5,
            Self::EventOff => 6,
            Self::EventEmit => 7,
            Self::StreamRequest => 8,
            Self::StreamAccept => 9,
            Self::StreamData => 10,
            Self::StreamPause => 11,
            Self::StreamResume => 12,
            Self::StreamEnd => 13,
            Self::Custom(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Set,
            1 => Self::Get,
            2 => Self::Ping,
            3 => Self::ContextAttach,
            4 => Self::ContextDetach,
            5 => Self::EventOn,
            6 => Self::EventOff,
            7 => Self::EventEmit,
            8 => Self::StreamRequest,
            9 => Self::StreamAccept,
            10 => Self::StreamData,
            11 => Self::StreamPause,
            12 => Self::StreamResume,
            13 => Self::StreamEnd,
            other => Self::Custom(other),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Self::StreamRequest
                | Self::StreamAccept
                | Self::StreamData
                | Self::StreamPause
                | Self::StreamResume
                | Self::StreamEnd
        )
    }
}

/// The packed 32-bit flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

fn low_mask(bits: u32) -> u32 {
    if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 }
}

impl Flags {
    /// Builds a complete word: magic set, then impulse, status and action.
    pub fn new(impulse: bool, status: Status, action: Action) -> Self {
        let mut flags = Self::default();
        flags.write(1, 1, MAGIC_OFFSET);
        flags.write(impulse as u32, 1, IMPULSE_OFFSET);
        flags.write(status as u32, STATUS_BITS, STATUS_OFFSET);
        flags.write(action.code() as u32, ACTION_BITS, ACTION_OFFSET);
        flags
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// ORs the low `bits` bits of `value` into the word at `offset`.
    pub fn write(&mut self, value: u32, bits: u32, offset: u32) {
        self.0 |= (value & low_mask(bits)) << offset;
    }

    /// Extracts `bits` bits starting at `offset`.
    pub fn read(&self, bits: u32, offset: u32) -> u32 {
        (self.0 >> offset) & low_mask(bits)
    }

    pub fn magic(&self) -> bool {
        self.read(1, MAGIC_OFFSET) == 1
    }

    pub fn impulse(&self) -> bool {
        self.read(1, IMPULSE_OFFSET) == 1
    }

    pub fn status_code(&self) -> u8 {
        self.read(STATUS_BITS, STATUS_OFFSET) as u8
    }

    pub fn action(&self) -> Action {
        Action::from_code(self.read(ACTION_BITS, ACTION_OFFSET) as u8)
    }

    /// Rejects a word without the magic bit, or with a status nobody sends.
    pub fn validate(&self) -> Result<Status> {
        if !self.magic() {
            return Err(WireError::MalformedFlags(self.0));
        }
        Status::from_code(self.status_code()).ok_or(WireError::UnknownStatus(self.status_code()))
    }
}
