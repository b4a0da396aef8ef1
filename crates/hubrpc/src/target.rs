//! Local RPC targets
//!
//! A target is an explicit `{method name → handler}` table, built once per
//! object with [`TargetBuilder`], plus an optional disposal hook.

use crate::error::{Result, RpcError};
use crate::value::RpcValue;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Method handler function type
pub type MethodHandler =
    Arc<dyn Fn(Vec<RpcValue>) -> BoxFuture<'static, Result<RpcValue>> + Send + Sync>;

/// Wrap a closure into a [`MethodHandler`]
pub fn handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(Vec<RpcValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcValue>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// An object whose methods can be invoked by name
pub struct LocalTarget {
    name: String,
    methods: HashMap<String, MethodHandler>,
    on_dispose: Option<Box<dyn Fn() + Send + Sync>>,
    disposed: AtomicBool,
}

impl LocalTarget {
    /// Start building a target; `name` is used in diagnostics only
    pub fn builder(name: impl Into<String>) -> TargetBuilder {
        TargetBuilder {
            target: LocalTarget {
                name: name.into(),
                methods: HashMap::new(),
                on_dispose: None,
                disposed: AtomicBool::new(false),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a method handler
    pub fn method(&self, name: &str) -> Option<&MethodHandler> {
        self.methods.get(name)
    }

    /// All method names of this target
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Invoke a method directly, without any serialization
    pub async fn invoke(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        if self.is_disposed() {
            return Err(RpcError::ObjectDisposed(self.name.clone()));
        }
        let handler = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
        handler(args).await
    }

    /// Whether the object has its own disposal logic
    pub fn supports_disposal(&self) -> bool {
        self.on_dispose.is_some()
    }

    /// Dispose the object; runs the disposal hook at most once
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = &self.on_dispose {
            hook();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTarget")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Builder for [`LocalTarget`]
pub struct TargetBuilder {
    target: LocalTarget,
}

impl TargetBuilder {
    /// Register a method handler
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue>> + Send + 'static,
    {
        self.target.methods.insert(name.into(), handler(f));
        self
    }

    /// Run `hook` when the object is disposed
    pub fn on_dispose<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.target.on_dispose = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Arc<LocalTarget> {
        Arc::new(self.target)
    }
}
