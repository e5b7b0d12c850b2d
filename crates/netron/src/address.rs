//! Normalised endpoint addresses.

use std::fmt;

use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self { protocol: protocol.into(), host: host.into(), port }
    }

    /// Parses `host[:port]`, optionally prefixed with `protocol//`.
    ///
    /// A missing port falls back to `default_port`, a missing protocol to `protocol`.
    pub fn parse(input: &str, protocol: &str, default_port: u16) -> Result<Self> {
        let (protocol, rest) = match input.split_once("//") {
            Some((proto, rest)) if !proto.is_empty() => (proto, rest),
            Some((_, rest)) => (protocol, rest),
            None => (protocol, input),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidArgument(format!("invalid port in address '{input}'")))?;
                (host, port)
            }
            None => (rest, default_port),
        };

        if host.is_empty() {
            return Err(Error::InvalidArgument(format!("missing host in address '{input}'")));
        }

        Ok(Self::new(protocol, host, port))
    }

    /// Registry key, `"{protocol}//{host}:{port}"`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//{}:{}", self.protocol, self.host, self.port)
    }
}
