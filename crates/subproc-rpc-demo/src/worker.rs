//! Services the demo runner serves to its parent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use subproc_rpc::{
    CallContext, MethodService, Result, RpcService, ServiceError, ServiceRegistry, SubProcRunner,
    TypeAdvertisement, TypeRegistry,
};

use crate::comm::{Args, Args2, Outcome, comm_types};

/// `simple.Multiply`: `a * b`, plus the parent's `simple2.Plus(a, b)` when
/// a callback channel is up.
pub fn simple_service(runner: Arc<SubProcRunner>) -> MethodService {
    MethodService::new()
        .advertise(TypeAdvertisement::new().with::<Args>("comm.Args"))
        .method("Multiply", move |args: Args| {
            let runner = Arc::clone(&runner);
            async move {
                let product = args.a * args.b;
                match runner.callback::<_, i64>("simple2.Plus", &args).await {
                    Ok(sum) => Ok::<_, ServiceError>(product + sum),
                    Err(e) => {
                        tracing::debug!(error = %e, "Plus callback unavailable");
                        Ok(product)
                    }
                }
            }
        })
}

/// `complex.Init`: echoes its arguments back as a polymorphic payload.
pub struct Complex {
    types: Arc<TypeRegistry>,
}

impl Complex {
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self { types }
    }

    fn init(&self, args: Args2) -> Result<Outcome, ServiceError> {
        tracing::info!(?args, "Complex init");
        let data = self
            .types
            .pack(&args)
            .map_err(|e| ServiceError::failed(e.to_string()))?;
        Ok(Outcome::success("initialized").with_data(data))
    }
}

#[async_trait]
impl RpcService for Complex {
    async fn call(
        &self,
        method: &str,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, ServiceError> {
        match method {
            "Init" => {
                let args: Args2 = serde_json::from_value(args).map_err(|source| {
                    ServiceError::InvalidArgs {
                        method: ctx.method().to_string(),
                        source,
                    }
                })?;
                let outcome = self.init(args)?;
                serde_json::to_value(outcome).map_err(|e| ServiceError::failed(e.to_string()))
            }
            _ => Err(ServiceError::UnknownMethod(ctx.method().to_string())),
        }
    }

    fn advertised_types(&self) -> TypeAdvertisement {
        comm_types()
    }
}

/// `echo.Ping` returns its argument, `echo.Sleep` waits the given
/// milliseconds, `echo.Fail` always errors.
pub fn echo_service() -> MethodService {
    MethodService::new()
        .method("Ping", |value: serde_json::Value| async move {
            Ok::<_, ServiceError>(value)
        })
        .method("Sleep", |millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, ServiceError>(millis)
        })
        .method("Fail", |message: String| async move {
            Err::<(), _>(ServiceError::failed(message))
        })
}

/// Everything the demo runner serves, minus anything process-specific.
pub fn worker_services(runner: Arc<SubProcRunner>, echo: MethodService) -> Result<ServiceRegistry> {
    let types = Arc::clone(runner.type_registry());
    ServiceRegistry::new()
        .with("simple", simple_service(runner))?
        .with("complex", Complex::new(types))?
        .with("echo", echo)
}
