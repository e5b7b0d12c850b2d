pub mod address;
pub mod channel;
pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod events;
pub mod hooks;
pub mod interface;
mod marshal;
pub mod netron;
pub mod peer;
pub mod stub;
pub mod transport;
pub mod twin;
pub mod wire;

pub use crate::address::Address;
pub use crate::config::NetronConfig;
pub use crate::context::Context;
pub use crate::context::ContextBuilder;
pub use crate::error::Error;
pub use crate::error::ErrorKind;
pub use crate::error::RemoteError;
pub use crate::error::Result;
pub use crate::interface::Interface;
pub use crate::netron::Netron;
pub use crate::peer::Peer;
pub use crate::wire::Value;

#[cfg(test)]
mod tests;
