//! # Wire Model
//!
//! Everything that crosses a connection: the flags word, the packet envelope,
//! payload values and the typed encoders for definitions and references.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on hostile input.
//! - **Bounded Nesting**: Values deeper than `MAX_DEPTH` are rejected both ways.

pub mod definition;
pub mod flags;
pub mod packet;
pub mod value;

pub use definition::Definition;
pub use definition::DefinitionId;
pub use definition::Definitions;
pub use definition::MemberMeta;
pub use definition::Reference;
pub use definition::TwinSource;
pub use definition::ROOT_PARENT;
pub use flags::Action;
pub use flags::Flags;
pub use flags::Status;
pub use packet::Packet;
pub use value::Value;
pub use value::MAX_DEPTH;

/// Failures while framing or parsing wire data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("malformed flags word {0:#010x}: magic bit unset")]
    MalformedFlags(u32),
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("value nesting exceeds {MAX_DEPTH} levels")]
    DepthLimit,
    #[error("{0} values must be marshalled before they cross the wire")]
    UnsupportedValue(&'static str),
    #[error("unknown extension type {0}")]
    UnknownExtension(u8),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Codec(#[from] netpack::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
