//! # Contexts
//!
//! A context is a local object that can be exposed to remote peers. The engine only
//! needs to know its class name and members, and how to call/read/write them.
//!
//! `ContextBuilder` assembles a context from closures for the common case where a
//! dedicated type would be boilerplate.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::Error;
use crate::error::Result;
use crate::wire::MemberMeta;
use crate::wire::TwinSource;
use crate::wire::Value;

/// A local object that can be attached to a netron.
#[async_trait]
pub trait Context: Send + Sync + 'static {
    /// Class name reported in definitions.
    fn name(&self) -> &str;

    fn description(&self) -> Option<String> {
        None
    }

    /// Public members in declaration order.
    fn members(&self) -> Vec<(String, MemberMeta)>;

    /// Inline override source shipped with this context's definitions.
    fn twin(&self) -> Option<TwinSource> {
        None
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    async fn get_property(&self, name: &str) -> Result<Value>;

    async fn set_property(&self, name: &str, value: Value) -> Result<()>;
}

impl fmt::Debug for dyn Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({})", self.name())
    }
}

/// Identity of the underlying instance, ignoring vtables.
pub(crate) fn same_instance(a: &Arc<dyn Context>, b: &Arc<dyn Context>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Rejects instances that cannot be exposed: anonymous, or without public members.
pub fn validate(instance: &dyn Context) -> Result<()> {
    if instance.name().is_empty() {
        return Err(Error::NotValid("anonymous contexts cannot be exposed".into()));
    }
    if instance.members().is_empty() {
        return Err(Error::NotValid(format!("context '{}' has no public members", instance.name())));
    }
    Ok(())
}

type MethodFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A context assembled by `ContextBuilder`.
pub struct ObjectContext {
    name: String,
    description: Option<String>,
    twin: Option<TwinSource>,
    members: Vec<(String, MemberMeta)>,
    methods: HashMap<String, MethodFn>,
    properties: DashMap<String, Value>,
}

#[async_trait]
impl Context for ObjectContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    fn members(&self) -> Vec<(String, MemberMeta)> {
        self.members.clone()
    }

    fn twin(&self) -> Option<TwinSource> {
        self.twin.clone()
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let Some(handler) = self.methods.get(method) else {
            return Err(Error::NotExists(format!("'{}' has no method '{method}'", self.name)));
        };
        handler(args).await
    }

    async fn get_property(&self, name: &str) -> Result<Value> {
        self.properties
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotExists(format!("'{}' has no property '{name}'", self.name)))
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        match self.properties.get_mut(name) {
            Some(mut entry) => {
                *entry = value;
                Ok(())
            }
            None => Err(Error::NotExists(format!("'{}' has no property '{name}'", self.name))),
        }
    }
}

/// Fluent builder for closure-backed contexts.
pub struct ContextBuilder {
    inner: ObjectContext,
}

impl ContextBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: ObjectContext {
                name: name.into(),
                description: None,
                twin: None,
                members: Vec::new(),
                methods: HashMap::new(),
                properties: DashMap::new(),
            },
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.inner.description = Some(text.into());
        self
    }

    pub fn twin(mut self, twin: TwinSource) -> Self {
        self.inner.twin = Some(twin);
        self
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        self.inner.members.push((name.clone(), MemberMeta::method()));
        self.inner.methods.insert(name, Arc::new(move |args| f(args).boxed()));
        self
    }

    pub fn property(mut self, name: impl Into<String>, initial: impl Into<Value>) -> Self {
        let name = name.into();
        self.inner.members.push((name.clone(), MemberMeta::property()));
        self.inner.properties.insert(name, initial.into());
        self
    }

    pub fn readonly(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        self.inner.members.push((name.clone(), MemberMeta::readonly()));
        self.inner.properties.insert(name, value.into());
        self
    }

    pub fn build(self) -> Arc<dyn Context> {
        Arc::new(self.inner)
    }
}
