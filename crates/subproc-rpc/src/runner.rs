//! Worker-side lifecycle: parse launch arguments, serve the parent, stop on
//! request or signal.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::abort::spawn_abort_listener;
use crate::base_child::BaseChildService;
use crate::bridge::protocol::BASE_CHILD_SERVICE;
use crate::callback::{CallbackClient, DEFAULT_CALL_TIMEOUT};
use crate::dial::DialPolicy;
use crate::error::{Result, SprError};
use crate::logging;
use crate::rpc::server::RpcServer;
use crate::rpc::service::ServiceRegistry;
use crate::types::{TypeAdvertisement, TypeRegistry};

/// Positional launch arguments shared by caller and runner:
/// `<name> <log-level> <rpc-port> [callback-port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerArgs {
    pub name: String,
    pub log_level: String,
    pub rpc_port: u16,
    pub callback_port: Option<u16>,
}

impl RunnerArgs {
    /// Parse arguments without the program name. An empty callback port
    /// means no callback channel.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        if args.len() < 3 {
            return Err(SprError::invalid_param(format!(
                "expected <name> <log-level> <rpc-port> [callback-port], got {} argument(s)",
                args.len()
            )));
        }

        let name = args[0].trim();
        if name.is_empty() {
            return Err(SprError::invalid_param("runner name is empty"));
        }
        let rpc_port = parse_port(&args[2], "rpc port")?;
        let callback_port = match args.get(3).map(|p| p.trim()) {
            None | Some("") => None,
            Some(p) => Some(parse_port(p, "callback port")?),
        };

        Ok(Self {
            name: name.to_string(),
            log_level: args[1].clone(),
            rpc_port,
            callback_port,
        })
    }

    /// Parse `std::env::args()`, skipping the program name.
    pub fn from_env() -> Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    /// The command line a caller passes to the runner program.
    pub fn to_argv(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.log_level.clone(),
            self.rpc_port.to_string(),
            self.callback_port.map(|p| p.to_string()).unwrap_or_default(),
        ]
    }
}

fn parse_port(value: &str, what: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) => Err(SprError::invalid_param(format!("{what} must not be 0"))),
        Ok(port) => Ok(port),
        Err(e) => Err(SprError::invalid_param(format!("{what} {value:?}: {e}"))),
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Retry policy for dialing the parent's callback listener.
    pub callback_dial: DialPolicy,
    /// Stop on SIGINT, SIGTERM, SIGHUP and SIGQUIT.
    pub handle_signals: bool,
    /// Pause between the stop reply being flushed and the listener closing.
    pub stop_grace: Duration,
    /// Longest the stop waits for its own reply to be flushed.
    pub stop_flush_timeout: Duration,
    /// Bound on each callback call.
    pub call_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            callback_dial: DialPolicy::default().with_attempts(20),
            handle_signals: true,
            stop_grace: Duration::from_millis(10),
            stop_flush_timeout: Duration::from_secs(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Stop switch and callback slot shared by the runner, its `baseChild`
/// service and the abort listener.
pub(crate) struct RunnerControl {
    shutdown: CancellationToken,
    stopping: AtomicBool,
    callback: Mutex<Option<Arc<CallbackClient>>>,
    callback_settled: watch::Sender<bool>,
}

impl RunnerControl {
    pub(crate) fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            callback: Mutex::new(None),
            callback_settled: watch::Sender::new(false),
        }
    }

    /// Mark a stop as requested. `false` if one already was.
    pub(crate) fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_loop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if !self.shutdown.is_cancelled() {
            tracing::info!("Stopping runner loop");
        }
        self.shutdown.cancel();
        // The client stays in its slot so later callbacks fail as NotConnected.
        if let Some(callback) = self.lock_callback().as_ref() {
            callback.disconnect();
        }
        self.callback_settled.send_replace(true);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    fn lock_callback(&self) -> std::sync::MutexGuard<'_, Option<Arc<CallbackClient>>> {
        self.callback.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Worker-side handle. One `run` per runner.
pub struct SubProcRunner {
    control: Arc<RunnerControl>,
    config: RunnerConfig,
    types: Arc<TypeRegistry>,
    started: AtomicBool,
}

impl Default for SubProcRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SubProcRunner {
    pub fn new() -> Self {
        Self::with_config(RunnerConfig::default())
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Self {
            control: Arc::new(RunnerControl::new()),
            config,
            types: TypeRegistry::shared(),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_type_registry(mut self, types: Arc<TypeRegistry>) -> Self {
        self.types = types;
        self
    }

    pub fn type_registry(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Serve `services` using the process arguments until stopped.
    pub async fn run(
        &self,
        services: ServiceRegistry,
        callback_types: &[TypeAdvertisement],
    ) -> Result<()> {
        self.run_hooked(RunnerArgs::from_env, services, callback_types)
            .await
    }

    /// Serve `services` until a remote stop, a signal or [`stop_loop`](Self::stop_loop).
    pub async fn run_with_args(
        &self,
        args: RunnerArgs,
        services: ServiceRegistry,
        callback_types: &[TypeAdvertisement],
    ) -> Result<()> {
        self.run_hooked(move || Ok(args), services, callback_types)
            .await
    }

    /// The abort hook goes in before the arguments are parsed, so a signal
    /// at any point of startup stops the runner cleanly.
    async fn run_hooked<F>(
        &self,
        args: F,
        services: ServiceRegistry,
        callback_types: &[TypeAdvertisement],
    ) -> Result<()>
    where
        F: FnOnce() -> Result<RunnerArgs>,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            let name = args().map(|a| a.name).unwrap_or_default();
            tracing::warn!(%name, "Runner already running");
            return Err(SprError::AlreadyRunning(name));
        }

        let abort = if self.config.handle_signals {
            let control = Arc::clone(&self.control);
            match spawn_abort_listener(move || control.stop_loop(), self.control.shutdown.clone()) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install abort signal handlers");
                    None
                }
            }
        } else {
            None
        };

        let result = match args() {
            Ok(args) => self.serve(args, services, callback_types).await,
            Err(e) => {
                tracing::error!(error = %e, "Invalid runner arguments");
                Err(e)
            }
        };

        if let Some(abort) = abort {
            abort.abort();
        }
        self.control.stop_loop();
        result
    }

    async fn serve(
        &self,
        args: RunnerArgs,
        mut services: ServiceRegistry,
        callback_types: &[TypeAdvertisement],
    ) -> Result<()> {
        if let Err(e) = logging::set_level(&args.log_level) {
            tracing::warn!(level = %args.log_level, error = %e, "Could not apply log level");
        }

        services.register_builtin(
            BASE_CHILD_SERVICE,
            Arc::new(BaseChildService::new(
                Arc::clone(&self.control),
                self.config.stop_grace,
                self.config.stop_flush_timeout,
            )),
        )?;
        self.types.register_all(&services.advertised_types())?;
        self.types.register_all(callback_types)?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, args.rpc_port));
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            tracing::error!(%addr, error = %source, "Runner failed to listen");
            SprError::Listen {
                addr: addr.to_string(),
                source,
            }
        })?;

        match args.callback_port {
            Some(port) => self.spawn_callback_dial(port, callback_types.to_vec()),
            None => {
                self.control.callback_settled.send_replace(true);
            }
        }

        tracing::info!(name = %args.name, %addr, callback_port = ?args.callback_port, "Runner serving");
        RpcServer::new(args.name.as_str(), services)
            .serve(listener, self.control.shutdown.clone())
            .await;
        tracing::info!(name = %args.name, "Runner stopped");
        Ok(())
    }

    fn spawn_callback_dial(&self, port: u16, types: Vec<TypeAdvertisement>) {
        let client = Arc::new(
            CallbackClient::new(Arc::clone(&self.types)).with_call_timeout(self.config.call_timeout),
        );
        *self.control.lock_callback() = Some(Arc::clone(&client));

        let control = Arc::clone(&self.control);
        let policy = self.config.callback_dial.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = control.stopped() => {}
                connected = client.connect_with_policy(port, &types, &policy) => match connected {
                    Ok(()) => tracing::info!(port, "Callback channel connected"),
                    Err(e) => tracing::warn!(port, error = %e, "Callback channel unavailable"),
                }
            }
            control.callback_settled.send_replace(true);
        });
    }

    /// Call a service the parent registered on its callback listener.
    pub async fn callback<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut settled = self.control.callback_settled.subscribe();
        let _ = settled.wait_for(|done| *done).await.map(|_| ());

        let client = self
            .control
            .lock_callback()
            .clone()
            .ok_or(SprError::NoCallback)?;
        client.call(method, args).await
    }

    pub fn is_callback_connected(&self) -> bool {
        self.control
            .lock_callback()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Stop serving. Idempotent and callable from any task.
    pub fn stop_loop(&self) {
        self.control.stop_loop();
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }
}
