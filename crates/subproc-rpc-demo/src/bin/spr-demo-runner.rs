//! Demo worker: `spr-demo-runner <name> <log-level> <rpc-port> [callback-port]`.

use std::sync::Arc;
use std::time::Duration;

use subproc_rpc::{ServiceError, SubProcRunner, logging};
use subproc_rpc_demo::comm::comm_types;
use subproc_rpc_demo::worker::{echo_service, worker_services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let runner = Arc::new(SubProcRunner::new());

    // `echo.Exit` replies, then ends the process: stands in for a crashing worker.
    let echo = echo_service().method("Exit", |code: i32| async move {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::process::exit(code);
        });
        Ok::<_, ServiceError>(code)
    });
    let services = worker_services(Arc::clone(&runner), echo)?;

    runner.run(services, &[comm_types()]).await?;
    Ok(())
}
