//! # Stubs
//!
//! A stub binds one local instance to one definition and answers get/set requests
//! against it. Arguments from a remote caller are unmarshalled on the way in, and
//! results are marshalled for that caller on the way out.

use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::marshal;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::wire::Definition;
use crate::wire::DefinitionId;
use crate::wire::MemberMeta;
use crate::wire::Value;

pub struct Stub {
    definition: Definition,
    instance: Arc<dyn Context>,
}

impl Stub {
    pub(crate) fn new(
        id: DefinitionId,
        parent_id: DefinitionId,
        instance: Arc<dyn Context>,
        uid: Option<String>,
    ) -> Self {
        let definition = Definition {
            id,
            parent_id,
            name: instance.name().to_string(),
            description: instance.description(),
            members: instance.members(),
            twin: instance.twin(),
            uid,
        };
        Self { definition, instance }
    }

    pub fn id(&self) -> DefinitionId {
        self.definition.id
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn instance(&self) -> &Arc<dyn Context> {
        &self.instance
    }

    /// Peer this stub was exposed to, if it was exposed to one.
    pub fn uid(&self) -> Option<&str> {
        self.definition.uid.as_deref()
    }

    fn member(&self, name: &str) -> Result<MemberMeta> {
        self.definition.member(name).ok_or_else(|| {
            Error::NotExists(format!("'{}' has no member '{name}'", self.definition.name))
        })
    }

    /// Reads a property or calls a method. For properties, `args[0]` is the
    /// default returned in place of null.
    pub(crate) async fn get(
        &self,
        netron: &Netron,
        member: &str,
        args: Vec<Value>,
        peer: Option<&Arc<Peer>>,
    ) -> Result<Value> {
        let meta = self.member(member)?;
        let args = match peer {
            Some(peer) => marshal::unmarshal_all(netron, peer, args)?,
            None => args,
        };

        let result = if meta.method {
            self.instance.call(member, args).await?
        } else {
            match self.instance.get_property(member).await? {
                Value::Null => args.into_iter().next().unwrap_or_default(),
                value => value,
            }
        };

        match peer {
            Some(peer) => marshal::marshal(netron, peer, result, self.id()),
            None => Ok(result),
        }
    }

    /// Writes a property, or calls a method discarding its result.
    pub(crate) async fn set(
        &self,
        netron: &Netron,
        member: &str,
        value: Value,
        peer: Option<&Arc<Peer>>,
    ) -> Result<()> {
        let meta = self.member(member)?;
        let value = match peer {
            Some(peer) => marshal::unmarshal(netron, peer, value)?,
            None => value,
        };

        if meta.method {
            let args = match value {
                Value::List(args) => args,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            self.instance.call(member, args).await?;
            Ok(())
        } else if meta.readonly {
            Err(Error::InvalidArgument(format!(
                "'{}.{member}' is read-only",
                self.definition.name
            )))
        } else {
            self.instance.set_property(member, value).await
        }
    }
}
