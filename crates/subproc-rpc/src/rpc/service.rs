//! Named services and method dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::oneshot;

use crate::bridge::protocol::{BASE_CHILD_SERVICE, split_method};
use crate::error::{Result, ServiceError, SprError};
use crate::types::TypeAdvertisement;

/// Per-request context handed to every service call.
pub struct CallContext {
    method: String,
    flushed: Mutex<Vec<oneshot::Sender<()>>>,
}

impl CallContext {
    pub(crate) fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            flushed: Mutex::new(Vec::new()),
        }
    }

    /// Full `service.Method` name of the request.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Resolves once this call's reply has been written and flushed to the
    /// peer. Errors if the reply could not be written.
    pub fn reply_flushed(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().push(tx);
        rx
    }

    pub(crate) fn mark_flushed(&self) {
        for tx in self.lock().drain(..) {
            let _ = tx.send(());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<oneshot::Sender<()>>> {
        self.flushed.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A remotely invocable service.
///
/// `method` is the bare method name (the part after the last `.`).
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, ServiceError>;

    /// Concrete types this service carries in polymorphic fields.
    fn advertised_types(&self) -> TypeAdvertisement {
        TypeAdvertisement::default()
    }
}

type MethodFuture = BoxFuture<'static, Result<serde_json::Value, ServiceError>>;
type MethodFn = Box<dyn Fn(serde_json::Value) -> MethodFuture + Send + Sync>;

/// Service assembled from typed async closures.
///
/// ```ignore
/// let simple = MethodService::new()
///     .method("Multiply", |args: Args| async move { Ok::<_, ServiceError>(args.a * args.b) });
/// ```
#[derive(Default)]
pub struct MethodService {
    methods: HashMap<String, MethodFn>,
    types: TypeAdvertisement,
}

impl MethodService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
    {
        let name = name.into();
        let method_name = name.clone();
        let boxed: MethodFn = Box::new(move |raw: serde_json::Value| -> MethodFuture {
            let args = match serde_json::from_value::<A>(raw) {
                Ok(args) => args,
                Err(source) => {
                    let method = method_name.clone();
                    return Box::pin(async move { Err(ServiceError::InvalidArgs { method, source }) });
                }
            };
            let fut = handler(args);
            Box::pin(async move {
                let reply = fut.await?;
                serde_json::to_value(reply)
                    .map_err(|e| ServiceError::failed(format!("encode reply: {e}")))
            })
        });
        self.methods.insert(name, boxed);
        self
    }

    pub fn advertise(mut self, types: TypeAdvertisement) -> Self {
        self.types = types;
        self
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[async_trait]
impl RpcService for MethodService {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, ServiceError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| ServiceError::UnknownMethod(ctx.method().to_string()))?;
        handler(args).await
    }

    fn advertised_types(&self) -> TypeAdvertisement {
        self.types.clone()
    }
}

/// Name → service table served by one listener.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn RpcService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `service` under `name`. Duplicate and reserved names are rejected.
    pub fn register(&mut self, name: impl Into<String>, service: impl RpcService) -> Result<()> {
        self.register_arc(name, Arc::new(service))
    }

    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        service: Arc<dyn RpcService>,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(SprError::invalid_param("service name must not be empty"));
        }
        if name == BASE_CHILD_SERVICE {
            return Err(SprError::DuplicateService(name));
        }
        self.insert_unique(name, service)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, service: impl RpcService) -> Result<Self> {
        self.register(name, service)?;
        Ok(self)
    }

    pub(crate) fn register_builtin(
        &mut self,
        name: &str,
        service: Arc<dyn RpcService>,
    ) -> Result<()> {
        self.insert_unique(name.to_string(), service)
    }

    fn insert_unique(&mut self, name: String, service: Arc<dyn RpcService>) -> Result<()> {
        if self.services.contains_key(&name) {
            return Err(SprError::DuplicateService(name));
        }
        self.services.insert(name, service);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn advertised_types(&self) -> Vec<TypeAdvertisement> {
        self.services
            .values()
            .map(|s| s.advertised_types())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Route `service.Method` to its service.
    pub async fn dispatch(
        &self,
        method: &str,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, ServiceError> {
        let (service, name) =
            split_method(method).ok_or_else(|| ServiceError::IllFormed(method.to_string()))?;
        let target = self
            .services
            .get(service)
            .ok_or_else(|| ServiceError::UnknownService(service.to_string()))?;
        target.call(name, args, ctx).await
    }
}
