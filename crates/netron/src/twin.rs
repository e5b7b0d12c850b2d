//! # Twins
//!
//! A twin overrides some members of a generated interface with client-side code.
//! Members the twin does not override keep the default remote behaviour.
//!
//! Twins come from two places:
//! - factories the application registers per definition name at startup, and
//! - inline sources shipped inside definitions, compiled by a pluggable
//!   `TwinInterpreter` (only when the configuration accepts twins).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::interface::Interface;
use crate::wire::Definition;
use crate::wire::TwinSource;
use crate::wire::Value;

#[async_trait]
pub trait Twin: Send + Sync + 'static {
    /// Whether this twin implements `member` itself.
    fn overrides(&self, member: &str) -> bool;

    /// Runs an overridden member. `base` is the plain generated proxy, so the
    /// twin can fall back to the remote member.
    async fn invoke(&self, base: &Interface, member: &str, args: Vec<Value>, void: bool) -> Result<Value>;
}

pub type TwinFactory = Arc<dyn Fn(&Definition) -> Result<Arc<dyn Twin>> + Send + Sync>;

/// Turns inline twin source into a twin.
pub trait TwinInterpreter: Send + Sync + 'static {
    fn compile(&self, source: &TwinSource, definition: &Definition) -> Result<Arc<dyn Twin>>;
}

#[derive(Default)]
pub(crate) struct TwinRegistry {
    factories: DashMap<String, TwinFactory>,
}

impl TwinRegistry {
    pub(crate) fn register(&self, name: &str, factory: TwinFactory) -> Result<()> {
        match self.factories.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::Exists(format!("twin for '{name}' already registered"))),
            Entry::Vacant(slot) => {
                slot.insert(factory);
                Ok(())
            }
        }
    }

    /// Registered factories win over inline sources.
    pub(crate) fn resolve(
        &self,
        definition: &Definition,
        interpreter: Option<&dyn TwinInterpreter>,
        accept_inline: bool,
    ) -> Result<Option<Arc<dyn Twin>>> {
        if let Some(factory) = self.factories.get(&definition.name).map(|f| f.clone()) {
            return factory(definition).map(Some);
        }

        let Some(source) = definition.twin.as_ref().filter(|_| accept_inline) else {
            return Ok(None);
        };
        match interpreter {
            Some(interpreter) => interpreter.compile(source, definition).map(Some),
            None => {
                debug!(name = %definition.name, "no twin interpreter, using plain interface");
                Ok(None)
            }
        }
    }
}
