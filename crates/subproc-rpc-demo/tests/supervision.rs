//! End-to-end supervision against the real `spr-demo-runner` binary.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use subproc_rpc::dial::dial;
use subproc_rpc::{
    CallbackListener, CallerConfig, DialPolicy, PING_METHOD, PortAllocator, RpcError, STOP_METHOD,
    ServiceRegistry, SprError, SubProcCaller, Termination, TypeRegistry,
};
use subproc_rpc_demo::comm::{Args2, Flags};
use subproc_rpc_demo::parent::{ComplexProxy, SimpleProxy, proxy_types, simple2_service};

const RUNNER: &str = env!("CARGO_BIN_EXE_spr-demo-runner");
const T: Duration = Duration::from_secs(10);

/// One allocator for the whole test binary so parallel tests never share a port.
fn ports() -> Arc<PortAllocator> {
    static PORTS: OnceLock<Arc<PortAllocator>> = OnceLock::new();
    Arc::clone(PORTS.get_or_init(|| Arc::new(PortAllocator::default())))
}

fn caller(types: &Arc<TypeRegistry>) -> SubProcCaller {
    SubProcCaller::new(ports())
        .with_type_registry(Arc::clone(types))
        .with_config(CallerConfig {
            log_level: Some("warn".into()),
            ..CallerConfig::default()
        })
}

async fn callback_listener() -> CallbackListener {
    let mut listener =
        CallbackListener::new(ports()).with_type_registry(Arc::new(TypeRegistry::new()));
    listener
        .start(
            "cbListener",
            ServiceRegistry::new().with("simple2", simple2_service()).unwrap(),
        )
        .await
        .unwrap();
    listener
}

#[tokio::test]
async fn full_lifecycle_with_callback() {
    let listener = callback_listener().await;
    let types = Arc::new(TypeRegistry::new());
    let mut caller = caller(&types);

    caller
        .create_and_connect_runner("spr_test_runner", RUNNER, &proxy_types(), listener.port())
        .await
        .unwrap();
    assert!(caller.is_connected());
    assert!(caller.pid().is_some());
    assert_eq!(caller.name(), "spr_test_runner");
    assert!(caller.ping().await.unwrap());

    // 3 * 4 plus the parent's 3 + 4.
    let product = SimpleProxy::new(&caller).multiply(3, 4).await.unwrap();
    assert_eq!(product, 19);

    let flags = Flags {
        bool_value: true,
        string_value: "StringValue".into(),
        u32_value: 100,
        u16_value: 200,
    };
    let complex = ComplexProxy::new(&caller, Arc::clone(&types));
    let outcome = complex.init("v1", "v2", flags.clone()).await;
    assert!(outcome.is_ok(), "{outcome:?}");
    assert_eq!(
        complex.payload(&outcome).unwrap(),
        Some(Args2 {
            string_value1: "v1".into(),
            string_value2: "v2".into(),
            flags1: Some(flags),
        })
    );

    assert_eq!(caller.terminate_runner_safely().await, Termination::Graceful);
    assert!(!caller.is_connected());
    assert_eq!(caller.pid(), None);
    assert!(matches!(caller.ping().await, Err(SprError::NotConnected(_))));
}

#[tokio::test]
async fn without_callback_port_multiply_skips_plus() {
    let types = Arc::new(TypeRegistry::new());
    let mut caller = caller(&types);
    caller
        .create_and_connect_runner("solo", RUNNER, &proxy_types(), None)
        .await
        .unwrap();

    let product = SimpleProxy::new(&caller).multiply(3, 4).await.unwrap();
    assert_eq!(product, 12);
    caller.terminate_runner_safely().await;
}

#[tokio::test]
async fn second_create_is_rejected() {
    let types = Arc::new(TypeRegistry::new());
    let mut caller = caller(&types);
    caller
        .create_and_connect_runner("w1", RUNNER, &[], None)
        .await
        .unwrap();
    let pid = caller.pid();

    let err = caller
        .create_and_connect_runner("w2", RUNNER, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, SprError::AlreadyCreated(_)));
    assert_eq!(caller.pid(), pid);
    assert_eq!(caller.name(), "w1");

    caller.terminate_runner_fastly();
}

#[tokio::test]
async fn echo_and_remote_errors() {
    let types = Arc::new(TypeRegistry::new());
    let mut caller = caller(&types);
    caller
        .create_and_connect_runner("w1", RUNNER, &[], None)
        .await
        .unwrap();

    let zero: i64 = caller.call("echo.Ping", &0).await.unwrap();
    assert_eq!(zero, 0);

    let err = caller.call::<_, ()>("echo.Fail", "nope").await.unwrap_err();
    assert!(matches!(err, SprError::Rpc(RpcError::Remote(ref m)) if m == "nope"));

    let err = caller.call::<_, ()>("echo.Missing", &0).await.unwrap_err();
    assert!(matches!(err, SprError::Rpc(RpcError::Remote(_))));

    let err = caller
        .call_with_timeout::<_, u64>("echo.Sleep", &2_000, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SprError::Rpc(RpcError::Timeout(_))));

    // The channel survives a timed-out call.
    assert!(caller.ping().await.unwrap());
    caller.terminate_runner_safely().await;
}

#[tokio::test]
async fn concurrent_calls_share_one_channel() {
    let types = Arc::new(TypeRegistry::new());
    let mut caller = caller(&types);
    caller
        .create_and_connect_runner("w1", RUNNER, &[], None)
        .await
        .unwrap();

    let started = Instant::now();
    let shared = &caller;
    let calls = (0..16u64)
        .map(|i| async move { shared.call::<_, u64>("echo.Sleep", &(100 + i)).await });
    let replies = futures::future::join_all(calls).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), 100 + i as u64);
    }
    assert!(started.elapsed() < Duration::from_millis(1_500));

    caller.terminate_runner_safely().await;
}

#[tokio::test]
async fn crashed_runner_is_killed_on_terminate() {
    let types = Arc::new(TypeRegistry::new());
    let mut caller = caller(&types);
    caller
        .create_and_connect_runner("w1", RUNNER, &[], None)
        .await
        .unwrap();

    let code: i32 = caller.call("echo.Exit", &3).await.unwrap();
    assert_eq!(code, 3);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    assert_eq!(caller.terminate_runner_safely().await, Termination::Forced);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(!caller.is_connected());
}

#[tokio::test]
async fn fast_termination_clears_state() {
    let types = Arc::new(TypeRegistry::new());
    let mut caller = caller(&types);
    caller
        .create_and_connect_runner("w1", RUNNER, &[], None)
        .await
        .unwrap();

    caller.terminate_runner_fastly();
    assert!(!caller.is_connected());
    assert_eq!(caller.pid(), None);
    assert_eq!(caller.rpc_port(), None);

    // The caller can be reused.
    caller
        .create_and_connect_runner("w2", RUNNER, &[], None)
        .await
        .unwrap();
    assert!(caller.ping().await.unwrap());
    caller.terminate_runner_safely().await;
}

#[tokio::test]
async fn runner_launched_by_hand_serves_and_exits() {
    let port = match std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 50010)) {
        Ok(_) => 50010,
        Err(_) => ports().try_allocate().unwrap(),
    };
    let mut child = tokio::process::Command::new(RUNNER)
        .args(["w1", "info", port.to_string().as_str(), ""])
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let client = dial(addr, &DialPolicy::default()).await.unwrap();
    let zero: i64 = client.call("echo.Ping", &0, T).await.unwrap();
    assert_eq!(zero, 0);
    let alive: bool = client.call(PING_METHOD, &0, T).await.unwrap();
    assert!(alive);

    let stopped: i64 = client.call(STOP_METHOD, &0, T).await.unwrap();
    assert_eq!(stopped, 0);

    let status = tokio::time::timeout(T, child.wait()).await.unwrap().unwrap();
    assert!(status.success());

    // A call after the stop fails instead of hanging.
    let after = tokio::time::timeout(T, client.call::<_, i64>("echo.Ping", &0, T))
        .await
        .unwrap();
    assert!(after.is_err());
}

#[tokio::test]
async fn runner_rejects_bad_arguments() {
    for args in [vec!["w1", "info", "notaport"], vec!["w1", "info"]] {
        let status = tokio::time::timeout(
            T,
            tokio::process::Command::new(RUNNER).args(&args).status(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!status.success(), "{args:?}");
    }
}

#[cfg(unix)]
#[tokio::test]
async fn sigterm_stops_runner_cleanly() {
    let port = ports().try_allocate().unwrap();
    let mut child = tokio::process::Command::new(RUNNER)
        .args(["w1", "info", port.to_string().as_str(), ""])
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    // Signal handlers are in place before the runner binds, so once the
    // dial succeeds a SIGTERM always takes the clean path.
    let _client = dial(addr, &DialPolicy::default()).await.unwrap();

    let pid = child.id().unwrap().to_string();
    let sent = tokio::process::Command::new("kill")
        .args(["-TERM", pid.as_str()])
        .status()
        .await
        .unwrap();
    assert!(sent.success());

    let status = tokio::time::timeout(T, child.wait()).await.unwrap().unwrap();
    assert!(status.success());
}
