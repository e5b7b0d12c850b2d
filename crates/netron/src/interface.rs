//! # Interfaces
//!
//! An `Interface` is the local proxy for a definition, owned either by a remote
//! peer (`uid` set) or by this process. There is one generic proxy type: every
//! member access goes through `invoke`, driven by the definition's metadata.
//!
//! Interfaces are cached by the core per `(uid, definition id)`, so clones of the
//! same handle compare equal with `same`.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use crate::error::Error;
use crate::error::Result;
use crate::netron::Netron;
use crate::twin::Twin;
use crate::wire::Definition;
use crate::wire::DefinitionId;
use crate::wire::Value;

#[derive(Clone)]
pub struct Interface {
    inner: Arc<Inner>,
}

struct Inner {
    definition: Definition,
    uid: Option<String>,
    netron: Weak<Netron>,
    twin: Option<(Arc<dyn Twin>, Interface)>,
}

impl Interface {
    pub(crate) fn plain(definition: Definition, uid: Option<String>, netron: Weak<Netron>) -> Self {
        Self { inner: Arc::new(Inner { definition, uid, netron, twin: None }) }
    }

    /// Layers `twin` over a plain proxy for the same definition.
    pub(crate) fn with_twin(base: Interface, twin: Arc<dyn Twin>) -> Self {
        let inner = Inner {
            definition: base.inner.definition.clone(),
            uid: base.inner.uid.clone(),
            netron: base.inner.netron.clone(),
            twin: Some((twin, base)),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn definition(&self) -> &Definition {
        &self.inner.definition
    }

    pub fn def_id(&self) -> DefinitionId {
        self.inner.definition.id
    }

    pub fn name(&self) -> &str {
        &self.inner.definition.name
    }

    /// Owning peer, or `None` for a local context.
    pub fn uid(&self) -> Option<&str> {
        self.inner.uid.as_deref()
    }

    pub fn has_twin(&self) -> bool {
        self.inner.twin.is_some()
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.inner.definition.member(name).is_some()
            || self.inner.twin.as_ref().is_some_and(|(twin, _)| twin.overrides(name))
    }

    /// Reference equality.
    pub fn same(&self, other: &Interface) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn netron(&self) -> Result<Arc<Netron>> {
        self.inner
            .netron
            .upgrade()
            .ok_or_else(|| Error::IllegalState("netron has been dropped".into()))
    }

    /// The single dispatch point for member access.
    ///
    /// Methods: `void` selects a fire-and-forget call. Properties: `void` selects a
    /// write of `args[0]`, otherwise a read with `args[0]` as the default.
    pub async fn invoke(&self, member: &str, args: Vec<Value>, void: bool) -> Result<Value> {
        if let Some((twin, base)) = &self.inner.twin {
            if twin.overrides(member) {
                return twin.invoke(base, member, args, void).await;
            }
        }
        self.invoke_remote(member, args, void).await
    }

    async fn invoke_remote(&self, member: &str, args: Vec<Value>, void: bool) -> Result<Value> {
        let def = &self.inner.definition;
        let meta = def
            .member(member)
            .ok_or_else(|| Error::NotExists(format!("'{}' has no member '{member}'", def.name)))?;
        let netron = self.netron()?;
        let uid = self.uid();

        match (meta.method, void) {
            (true, false) => netron.call(uid, def.id, member, args).await,
            (true, true) => {
                netron.call_void(uid, def.id, member, args).await?;
                Ok(Value::Null)
            }
            (false, false) => netron.get(uid, def.id, member, args).await,
            (false, true) => {
                if meta.readonly {
                    return Err(Error::InvalidArgument(format!("'{}.{member}' is read-only", def.name)));
                }
                let value = args.into_iter().next().unwrap_or_default();
                netron.set(uid, def.id, member, value).await?;
                Ok(Value::Null)
            }
        }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke(method, args, false).await
    }

    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.invoke(method, args, true).await.map(|_| ())
    }

    pub async fn get(&self, property: &str, default: Option<Value>) -> Result<Value> {
        self.invoke(property, default.into_iter().collect(), false).await
    }

    pub async fn set(&self, property: &str, value: Value) -> Result<()> {
        self.invoke(property, vec![value], true).await.map(|_| ())
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.inner.definition.name)
            .field("def_id", &self.inner.definition.id)
            .field("uid", &self.inner.uid)
            .field("twin", &self.has_twin())
            .finish()
    }
}
