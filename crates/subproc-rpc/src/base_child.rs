//! Built-in `baseChild` service every runner serves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::bridge::protocol::{PING, STOP_CHILD};
use crate::error::ServiceError;
use crate::rpc::service::{CallContext, RpcService};
use crate::runner::RunnerControl;

pub(crate) struct BaseChildService {
    control: Arc<RunnerControl>,
    grace: Duration,
    flush_timeout: Duration,
}

impl BaseChildService {
    pub(crate) fn new(control: Arc<RunnerControl>, grace: Duration, flush_timeout: Duration) -> Self {
        Self {
            control,
            grace,
            flush_timeout,
        }
    }

    /// Reply first, stop after: the stop waits until the reply frame is on
    /// the wire so the caller never sees its stop call fail.
    fn stop_child(&self, ctx: &CallContext) -> serde_json::Value {
        if !self.control.begin_stop() {
            tracing::debug!("Stop already requested");
            return json!(0);
        }

        let flushed = ctx.reply_flushed();
        let control = Arc::clone(&self.control);
        let (grace, flush_timeout) = (self.grace, self.flush_timeout);
        tokio::spawn(async move {
            match tokio::time::timeout(flush_timeout, flushed).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::debug!("Stop reply was not delivered"),
                Err(_) => tracing::debug!(?flush_timeout, "Stop reply not flushed in time"),
            }
            tokio::time::sleep(grace).await;
            control.stop_loop();
        });
        json!(0)
    }
}

#[async_trait]
impl RpcService for BaseChildService {
    async fn call(
        &self,
        method: &str,
        _args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<serde_json::Value, ServiceError> {
        match method {
            STOP_CHILD => Ok(self.stop_child(ctx)),
            PING => Ok(json!(self.control.is_alive())),
            _ => Err(ServiceError::UnknownMethod(ctx.method().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{PING_METHOD, STOP_METHOD};

    fn service() -> (BaseChildService, Arc<RunnerControl>) {
        let control = Arc::new(RunnerControl::new());
        let svc = BaseChildService::new(
            Arc::clone(&control),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        (svc, control)
    }

    #[tokio::test]
    async fn ping_reports_alive_until_stop() {
        let (svc, _control) = service();
        let ctx = CallContext::new(PING_METHOD);
        assert_eq!(svc.call(PING, json!(0), &ctx).await.unwrap(), json!(true));

        let ctx = CallContext::new(STOP_METHOD);
        assert_eq!(svc.call(STOP_CHILD, json!(0), &ctx).await.unwrap(), json!(0));

        let ctx = CallContext::new(PING_METHOD);
        assert_eq!(svc.call(PING, json!(0), &ctx).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn stop_waits_for_reply_flush() {
        let (svc, control) = service();
        let ctx = CallContext::new(STOP_METHOD);
        svc.call(STOP_CHILD, json!(0), &ctx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!control.is_stopped(), "stopped before the reply was flushed");

        ctx.mark_flushed();
        tokio::time::timeout(Duration::from_secs(5), control.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn undelivered_reply_still_stops() {
        let (svc, control) = service();
        let ctx = CallContext::new(STOP_METHOD);
        svc.call(STOP_CHILD, json!(0), &ctx).await.unwrap();
        drop(ctx);
        tokio::time::timeout(Duration::from_secs(5), control.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repeated_stop_is_a_no_op() {
        let (svc, control) = service();
        for _ in 0..2 {
            let ctx = CallContext::new(STOP_METHOD);
            assert_eq!(svc.call(STOP_CHILD, json!(0), &ctx).await.unwrap(), json!(0));
            ctx.mark_flushed();
        }
        tokio::time::timeout(Duration::from_secs(5), control.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let (svc, _control) = service();
        let ctx = CallContext::new("baseChild.Nope");
        let err = svc.call("Nope", json!(0), &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "rpc: can't find method baseChild.Nope");
    }
}
