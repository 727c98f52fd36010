//! Parent-side pieces: the callback service and typed proxies over a caller.

use std::sync::Arc;

use subproc_rpc::{MethodService, Result, ServiceError, SubProcCaller, TypeAdvertisement, TypeRegistry};

use crate::comm::{Args, Args2, Flags, Outcome, comm_types};

/// `simple2.Plus`, served to runners through the callback listener.
pub fn simple2_service() -> MethodService {
    MethodService::new()
        .advertise(TypeAdvertisement::new().with::<Args>("comm.Args"))
        .method("Plus", |args: Args| async move {
            Ok::<_, ServiceError>(args.a + args.b)
        })
}

/// Types the caller registers when it connects a demo runner.
pub fn proxy_types() -> Vec<TypeAdvertisement> {
    vec![comm_types()]
}

pub struct SimpleProxy<'a> {
    caller: &'a SubProcCaller,
}

impl<'a> SimpleProxy<'a> {
    pub fn new(caller: &'a SubProcCaller) -> Self {
        Self { caller }
    }

    pub async fn multiply(&self, a: i64, b: i64) -> Result<i64> {
        self.caller.call("simple.Multiply", &Args { a, b }).await
    }
}

pub struct ComplexProxy<'a> {
    caller: &'a SubProcCaller,
    types: Arc<TypeRegistry>,
}

impl<'a> ComplexProxy<'a> {
    pub fn new(caller: &'a SubProcCaller, types: Arc<TypeRegistry>) -> Self {
        Self { caller, types }
    }

    /// A transport failure becomes a remote-error outcome rather than an `Err`.
    pub async fn init(&self, value1: &str, value2: &str, flags: Flags) -> Outcome {
        let args = Args2 {
            string_value1: value1.to_string(),
            string_value2: value2.to_string(),
            flags1: Some(flags),
        };
        match self.caller.call::<_, Outcome>("complex.Init", &args).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "Lost runner during init");
                Outcome::remote_error(format!("Init: {e}"))
            }
        }
    }

    pub fn payload(&self, outcome: &Outcome) -> Result<Option<Args2>> {
        outcome.data_as::<Args2>(&self.types)
    }
}
