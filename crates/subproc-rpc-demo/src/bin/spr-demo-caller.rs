//! Demo parent: spawns `spr-demo-runner` (or the program given as the first
//! argument), calls into it, then stops it.

use std::sync::Arc;

use anyhow::Context;
use subproc_rpc::{CallbackListener, PortAllocator, ServiceRegistry, SubProcCaller, TypeRegistry, logging};
use subproc_rpc_demo::comm::Flags;
use subproc_rpc_demo::parent::{ComplexProxy, SimpleProxy, proxy_types, simple2_service};

fn runner_program() -> anyhow::Result<String> {
    if let Some(program) = std::env::args().nth(1) {
        return Ok(program);
    }
    let exe = std::env::current_exe().context("locate current executable")?;
    Ok(exe.with_file_name("spr-demo-runner").to_string_lossy().into_owned())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let ports = Arc::new(PortAllocator::from_env()?);
    let types = TypeRegistry::shared();

    let mut listener = CallbackListener::new(Arc::clone(&ports));
    listener
        .start("cbListener", ServiceRegistry::new().with("simple2", simple2_service())?)
        .await?;

    let program = runner_program()?;
    let mut caller = SubProcCaller::new(ports);
    caller
        .create_and_connect_runner("spr_test_runner", &program, &proxy_types(), listener.port())
        .await
        .with_context(|| format!("start runner {program}"))?;

    let product = SimpleProxy::new(&caller).multiply(3, 4).await?;
    tracing::info!(product, "Multiply");

    let complex = ComplexProxy::new(&caller, Arc::clone(&types));
    for (v1, v2, flags) in [
        (
            "v1",
            "v2",
            Flags {
                bool_value: true,
                string_value: "StringValue".into(),
                u32_value: 100,
                u16_value: 200,
            },
        ),
        (
            "v21",
            "v22",
            Flags {
                bool_value: false,
                string_value: "StringValue2".into(),
                u32_value: 102,
                u16_value: 202,
            },
        ),
    ] {
        let outcome = complex.init(v1, v2, flags).await;
        if outcome.is_ok() {
            let data = complex.payload(&outcome)?;
            tracing::info!(?data, "Init");
        } else {
            tracing::warn!(code = outcome.code, message = %outcome.message, "Init failed");
            caller.terminate_runner_fastly();
            break;
        }
    }

    let ended = caller.terminate_runner_safely().await;
    tracing::info!(?ended, "Runner terminated");
    listener.shutdown().await;
    Ok(())
}
