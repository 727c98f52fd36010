//! Parent-side lifecycle of one worker process.
//!
//! A [`SubProcCaller`] spawns a runner program, dials the RPC port it handed
//! the runner, and holds the connection and the child process together: both
//! are set or both are empty.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::process::{Child, Command};

use crate::bridge::protocol::{PING_METHOD, STOP_METHOD};
use crate::dial::{DialPolicy, dial_with_retry};
use crate::error::{Result, SprError};
use crate::logging;
use crate::ports::PortAllocator;
use crate::rpc::client::RpcClient;
use crate::runner::RunnerArgs;
use crate::types::{TypeAdvertisement, TypeRegistry};

#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Retry policy for reaching the freshly spawned runner.
    pub connect: DialPolicy,
    /// Default bound for [`SubProcCaller::call`].
    pub call_timeout: Duration,
    /// Bound on the stop request in [`SubProcCaller::terminate_runner_safely`].
    pub stop_timeout: Duration,
    /// How long a stopped runner may take to exit before it is killed.
    pub exit_grace: Duration,
    /// Level passed to runners. Defaults to this process's current level.
    pub log_level: Option<String>,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            connect: DialPolicy::default(),
            call_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(3),
            exit_grace: Duration::from_secs(5),
            log_level: None,
        }
    }
}

/// How [`SubProcCaller::terminate_runner_safely`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The runner acknowledged the stop request.
    Graceful,
    /// The stop request failed and the process was killed.
    Forced,
    /// Nothing was running.
    NotRunning,
}

/// Parent-side handle to a single runner process.
pub struct SubProcCaller {
    name: String,
    channel: Option<RpcClient>,
    child: Option<Child>,
    rpc_port: Option<u16>,
    ports: Arc<PortAllocator>,
    types: Arc<TypeRegistry>,
    config: CallerConfig,
}

impl SubProcCaller {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            name: String::new(),
            channel: None,
            child: None,
            rpc_port: None,
            ports,
            types: TypeRegistry::shared(),
            config: CallerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CallerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_type_registry(mut self, types: Arc<TypeRegistry>) -> Self {
        self.types = types;
        self
    }

    /// Spawn `program` as runner `name` and connect to it.
    ///
    /// On any failure the caller is left empty and the call may be retried.
    pub async fn create_and_connect_runner(
        &mut self,
        name: &str,
        program: &str,
        types: &[TypeAdvertisement],
        callback_port: Option<u16>,
    ) -> Result<()> {
        if self.channel.is_some() || self.child.is_some() {
            tracing::warn!(name, current = %self.name, "Runner already created");
            return Err(SprError::AlreadyCreated(self.name.clone()));
        }
        validate_launch_input(name, program)?;

        let rpc_port = self.ports.try_allocate().inspect_err(|e| {
            tracing::warn!(name, error = %e, "No port for runner");
        })?;
        let args = RunnerArgs {
            name: name.to_string(),
            log_level: self.log_level(),
            rpc_port,
            callback_port,
        };

        tracing::info!(name, program, rpc_port, ?callback_port, "Spawning runner");
        let mut child = Command::new(program)
            .args(args.to_argv())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                tracing::warn!(name, program, error = %source, "Failed to spawn runner");
                SprError::Spawn {
                    program: program.to_string(),
                    source,
                }
            })?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, rpc_port));
        let dialed = dial_with_retry(addr, &self.config.connect, || match child.try_wait() {
            Ok(Some(status)) => Err(SprError::Internal(format!(
                "runner {name} exited with {status} before accepting connections"
            ))),
            _ => Ok(()),
        })
        .await;
        let channel = match dialed {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(name, %addr, error = %e, "Runner unreachable, killing it");
                kill_and_reap(child, name.to_string());
                return Err(e);
            }
        };

        if let Err(e) = self.types.register_all(types) {
            tracing::warn!(name, error = %e, "Type registration failed, killing runner");
            channel.abort();
            kill_and_reap(child, name.to_string());
            return Err(e);
        }

        tracing::info!(name, pid = ?child.id(), rpc_port, "Runner connected");
        self.name = name.to_string();
        self.channel = Some(channel);
        self.child = Some(child);
        self.rpc_port = Some(rpc_port);
        Ok(())
    }

    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with_timeout(method, args, self.config.call_timeout)
            .await
    }

    pub async fn call_with_timeout<A, R>(&self, method: &str, args: &A, timeout: Duration) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let channel = self.channel.as_ref().ok_or_else(|| {
            tracing::warn!(method, "Call without a runner");
            SprError::not_connected("create runner first")
        })?;
        Ok(channel.call(method, args, timeout).await?)
    }

    /// `true` while the runner has not been asked to stop.
    pub async fn ping(&self) -> Result<bool> {
        self.call(PING_METHOD, &0).await
    }

    /// Ask the runner to stop, falling back to a kill. Never waits for the
    /// process to exit; reaping happens in the background.
    pub async fn terminate_runner_safely(&mut self) -> Termination {
        let name = std::mem::take(&mut self.name);
        self.rpc_port = None;
        let child = self.child.take();
        let Some(channel) = self.channel.take() else {
            if let Some(child) = child {
                kill_and_reap(child, name);
                return Termination::Forced;
            }
            return Termination::NotRunning;
        };

        tracing::info!(%name, "Stopping runner");
        let stopped = channel
            .call::<_, i64>(STOP_METHOD, &0, self.config.stop_timeout)
            .await;
        channel.close().await;

        match (stopped, child) {
            (Ok(_), Some(child)) => {
                tracing::info!(%name, "Runner stopped");
                reap_in_background(child, name, Some(self.config.exit_grace));
                Termination::Graceful
            }
            (Ok(_), None) => Termination::Graceful,
            (Err(e), child) => {
                tracing::warn!(%name, error = %e, "Stop runner failed, killing it");
                if let Some(child) = child {
                    kill_and_reap(child, name);
                }
                Termination::Forced
            }
        }
    }

    /// Kill the runner without asking.
    pub fn terminate_runner_fastly(&mut self) {
        let name = std::mem::take(&mut self.name);
        self.rpc_port = None;
        if let Some(child) = self.child.take() {
            tracing::info!(%name, pid = ?child.id(), "Killing runner");
            kill_and_reap(child, name);
        }
        if let Some(channel) = self.channel.take() {
            channel.abort();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn rpc_port(&self) -> Option<u16> {
        self.rpc_port
    }

    fn log_level(&self) -> String {
        self.config
            .log_level
            .clone()
            .unwrap_or_else(logging::current_level)
    }
}

impl Drop for SubProcCaller {
    fn drop(&mut self) {
        if self.child.is_some() || self.channel.is_some() {
            self.terminate_runner_fastly();
        }
    }
}

/// Reject names and programs that cannot safely become a command line.
fn validate_launch_input(name: &str, program: &str) -> Result<()> {
    fn check(what: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(SprError::invalid_param(format!("{what} is empty")));
        }
        if value.chars().any(char::is_control) {
            return Err(SprError::invalid_param(format!(
                "{what} contains control characters"
            )));
        }
        Ok(())
    }
    check("runner name", name)?;
    check("program", program)?;
    if name.starts_with('-') {
        return Err(SprError::invalid_param(format!(
            "runner name {name:?} looks like an option"
        )));
    }
    Ok(())
}

fn kill_and_reap(mut child: Child, name: String) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(%name, error = %e, "Kill failed, runner likely exited");
    }
    reap_in_background(child, name, None);
}

/// Wait for `child` off the current task. With `grace`, a child that has
/// not exited in time is killed.
fn reap_in_background(mut child: Child, name: String, grace: Option<Duration>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        // Outside a runtime, kill_on_drop hands the child to tokio's orphan reaper.
        let _ = child.start_kill();
        return;
    };
    handle.spawn(async move {
        let waited = match grace {
            Some(grace) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(%name, ?grace, "Runner did not exit, killing it");
                    let _ = child.start_kill();
                    child.wait().await
                }
            },
            None => child.wait().await,
        };
        match waited {
            Ok(status) => tracing::debug!(%name, %status, "Runner reaped"),
            Err(e) => tracing::warn!(%name, error = %e, "Failed to reap runner"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> SubProcCaller {
        SubProcCaller::new(Arc::new(PortAllocator::new(20000, 60000).unwrap()))
            .with_type_registry(Arc::new(TypeRegistry::new()))
            .with_config(CallerConfig {
                connect: DialPolicy::default()
                    .with_attempts(10)
                    .with_delay(Duration::from_millis(20)),
                ..CallerConfig::default()
            })
    }

    #[test]
    fn launch_input_validation() {
        assert!(validate_launch_input("w1", "/bin/worker").is_ok());
        assert!(validate_launch_input("my worker", "worker").is_ok());
        for (name, program) in [
            ("", "worker"),
            ("   ", "worker"),
            ("w1", ""),
            ("-rf", "worker"),
            ("w\0", "worker"),
            ("w1", "work\ner"),
        ] {
            let err = validate_launch_input(name, program).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParam, "{name:?} {program:?}");
        }
    }

    #[tokio::test]
    async fn empty_caller_rejects_calls() {
        let caller = caller();
        assert!(!caller.is_connected());
        assert_eq!(caller.pid(), None);
        let err = caller.call::<_, i64>("echo.Ping", &0).await.unwrap_err();
        assert!(matches!(err, SprError::NotConnected(_)));
        assert!(matches!(caller.ping().await, Err(SprError::NotConnected(_))));
    }

    #[tokio::test]
    async fn terminating_empty_caller_is_a_no_op() {
        let mut caller = caller();
        assert_eq!(caller.terminate_runner_safely().await, Termination::NotRunning);
        caller.terminate_runner_fastly();
        assert!(!caller.is_connected());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let mut caller = caller();
        let err = caller
            .create_and_connect_runner("w1", "/nonexistent/spr-runner", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SprError::Spawn { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
        assert!(!caller.is_connected());
        assert_eq!(caller.pid(), None);
    }

    #[tokio::test]
    async fn invalid_name_spawns_nothing() {
        let mut caller = caller();
        let err = caller
            .create_and_connect_runner("-x", "true", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParam);
    }

    #[tokio::test]
    async fn exhausted_ports_fail_before_spawn() {
        let held = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let mut caller = SubProcCaller::new(Arc::new(PortAllocator::new(port, port).unwrap()));
        let err = caller
            .create_and_connect_runner("w1", "/nonexistent/spr-runner", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SprError::NoPortAvailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runner_that_never_listens_is_cleaned_up() {
        // `true` ignores its arguments and exits immediately.
        let mut caller = caller();
        let started = std::time::Instant::now();
        let err = caller
            .create_and_connect_runner("w1", "true", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SprError::Internal(_) | SprError::ConnectTimeout { .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!caller.is_connected());
        assert_eq!(caller.pid(), None);
    }

    #[test]
    fn default_config_bounds() {
        let config = CallerConfig::default();
        assert_eq!(config.stop_timeout, Duration::from_secs(3));
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.connect.attempts, 100);
        assert_eq!(config.connect.delay, Duration::from_millis(50));
    }
}
