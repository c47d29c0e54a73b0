//! Lifecycle of the device plugin: serving the gRPC socket, registering with
//! the kubelet and relaying device health.

use std::future::Future;
use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Server;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::device_plugin_server::DevicePluginServer;
use crate::api::registration_client::RegistrationClient;
use crate::api::DevicePluginOptions;
use crate::api::RegisterRequest;
use crate::config::Config;
use crate::replicas::strip_replica;
use crate::replicas::Inventory;
use crate::resource::AllocationPolicy;
use crate::resource::Device;
use crate::resource::Health;
use crate::resource::ResourceManager;
use crate::service::DevicePluginService;

/// Kubelet device plugin API version.
pub const API_VERSION: &str = "v1beta1";

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_CHANNEL_CAPACITY: usize = 32;

/// Errors of the plugin lifecycle.
#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("failed to load devices for '{resource_name}'")]
    Devices { resource_name: String },
    #[display("failed to serve device plugin on {}", path.display())]
    Serve { path: PathBuf },
    #[display("failed to register with kubelet at {}", path.display())]
    Register { path: PathBuf },
    #[display("failed to remove device plugin socket {}", path.display())]
    Stop { path: PathBuf },
    #[display("GRPC server for '{resource_name}' has repeatedly crashed recently")]
    CrashLoop { resource_name: String },
}

impl core::error::Error for PluginError {}

/// Number of crashes tolerated within [`CRASH_WINDOW`] before giving up.
const MAX_RESTARTS: u32 = 5;
/// A crash further apart than this from the previous one resets the count.
const CRASH_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    Restart,
    GiveUp,
}

/// Bounds how often the gRPC server may crash and be restarted.
#[derive(Debug)]
pub struct CrashLoopBreaker {
    restarts: u32,
    last_crash: Instant,
}

impl CrashLoopBreaker {
    pub fn new(started_at: Instant) -> Self {
        Self {
            restarts: 0,
            last_crash: started_at,
        }
    }

    pub fn record_crash(&mut self, now: Instant) -> CrashVerdict {
        let since_last = now.saturating_duration_since(self.last_crash);
        self.last_crash = now;
        if since_last > CRASH_WINDOW {
            self.restarts = 1;
        } else {
            self.restarts += 1;
        }

        if self.restarts > MAX_RESTARTS {
            CrashVerdict::GiveUp
        } else {
            CrashVerdict::Restart
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// State of one serving session, shared with the RPC handlers.
pub(crate) struct SessionState {
    pub config: Arc<Config>,
    pub inventory: Inventory,
    pub policy: Option<Arc<dyn AllocationPolicy>>,
    pub options: DevicePluginOptions,
    /// replica list as advertised, including health
    pub snapshot: watch::Sender<Vec<Device>>,
    pub shutdown: CancellationToken,
}

impl SessionState {
    /// Flip the physical device and all its replicas to unhealthy and
    /// publish the new list to every watcher.
    pub fn mark_unhealthy(&self, physical_id: &str) {
        // No way back to healthy: a device stays unhealthy until restart.
        self.snapshot.send_modify(|replicas| {
            for replica in replicas
                .iter_mut()
                .filter(|r| strip_replica(&r.id) == physical_id)
            {
                replica.health = Health::Unhealthy;
            }
        });
        warn!(
            "'{}' device marked unhealthy: {physical_id}",
            self.config.resource_name
        );
    }
}

struct Session {
    state: Arc<SessionState>,
    server: JoinHandle<()>,
    health_checker: Option<JoinHandle<()>>,
    health_relay: Option<JoinHandle<()>>,
}

/// GPU Device Plugin for Kubernetes
pub struct GpuDevicePlugin {
    config: Arc<Config>,
    resource_manager: Arc<dyn ResourceManager>,
    policy: Option<Arc<dyn AllocationPolicy>>,
    /// `None` until started and after stopped
    session: Option<Session>,
}

impl GpuDevicePlugin {
    pub fn new(
        config: Config,
        resource_manager: Arc<dyn ResourceManager>,
        policy: Option<Arc<dyn AllocationPolicy>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resource_manager,
            policy,
            session: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_serving(&self) -> bool {
        self.session.is_some()
    }

    pub fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: self.policy.is_some()
                || self.config.replication.is_replicated(),
        }
    }

    /// Serve the gRPC socket, register with the kubelet and start health
    /// checks.
    #[tracing::instrument(skip(self), fields(resource = %self.config.resource_name))]
    pub async fn start(&mut self) -> Result<(), Report<PluginError>> {
        if self.is_serving() {
            warn!("device plugin already serving, restarting it");
            self.stop().await?;
        }

        let state = self.initialize()?;

        let server = match serve(state.clone(), &self.config.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                error!(
                    "Could not start device plugin for '{}': {e:?}",
                    self.config.resource_name
                );
                state.shutdown.cancel();
                if let Err(rm_err) = std::fs::remove_file(&self.config.socket_path) {
                    debug!("socket not removed after failed start: {rm_err}");
                }
                return Err(e);
            }
        };
        info!(
            "Starting to serve '{}' on {}",
            self.config.resource_name,
            self.config.socket_path.display()
        );
        self.session = Some(Session {
            state: state.clone(),
            server,
            health_checker: None,
            health_relay: None,
        });

        if let Err(e) = self.register().await {
            error!("Could not register device plugin: {e:?}");
            if let Err(stop_err) = self.stop().await {
                warn!("failed to stop device plugin after registration failure: {stop_err:?}");
            }
            return Err(e);
        }
        info!(
            "Registered device plugin for '{}' with Kubelet",
            self.config.resource_name
        );

        let (checker, relay) = self.spawn_health_tasks(&state);
        if let Some(session) = self.session.as_mut() {
            session.health_checker = Some(checker);
            session.health_relay = Some(relay);
        }
        Ok(())
    }

    /// Stop serving and forget all session state. Stopping a plugin that is
    /// not serving succeeds.
    pub async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let socket_path = &self.config.socket_path;
        info!(
            "Stopping to serve '{}' on {}",
            self.config.resource_name,
            socket_path.display()
        );

        session.state.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut session.server)
            .await
            .is_err()
        {
            warn!("gRPC server did not shut down within {SHUTDOWN_TIMEOUT:?}, aborting it");
            session.server.abort();
        }
        if let Some(relay) = session.health_relay {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, relay).await.is_err() {
                warn!("health relay did not stop within {SHUTDOWN_TIMEOUT:?}");
            }
        }
        // Blocking tasks cannot be aborted. The next session must not start
        // its checker before this one returns.
        if let Some(mut checker) = session.health_checker {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut checker)
                .await
                .is_err()
            {
                warn!("health checker still running after {SHUTDOWN_TIMEOUT:?}, waiting for it");
                if let Err(e) = checker.await {
                    warn!("health checker task failed: {e}");
                }
            }
        }

        match std::fs::remove_file(socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e).change_context(PluginError::Stop {
                path: socket_path.clone(),
            })),
        }
    }

    /// Register the plugin with the kubelet. Failures are returned as-is;
    /// retrying is up to the caller.
    pub async fn register(&self) -> Result<(), Report<PluginError>> {
        let kubelet_socket = &self.config.kubelet_socket_path;
        let context = || PluginError::Register {
            path: kubelet_socket.clone(),
        };
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );

        let channel = dial(kubelet_socket, DIAL_TIMEOUT)
            .await
            .change_context_lazy(context)?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: endpoint_name(&self.config.socket_path),
            resource_name: self.config.resource_name.clone(),
            options: Some(self.options()),
        };
        client
            .register(Request::new(request))
            .await
            .change_context_lazy(context)?;
        Ok(())
    }

    fn initialize(&self) -> Result<Arc<SessionState>, Report<PluginError>> {
        let devices = self.resource_manager.devices().map_err(|e| {
            Report::new(PluginError::Devices {
                resource_name: self.config.resource_name.clone(),
            })
            .attach_printable(format!("{e:#}"))
        })?;
        let inventory = Inventory::build(devices, self.config.replication);
        let (snapshot, _) = watch::channel(inventory.replicas().to_vec());

        Ok(Arc::new(SessionState {
            config: self.config.clone(),
            inventory,
            policy: self.policy.clone(),
            options: self.options(),
            snapshot,
            shutdown: CancellationToken::new(),
        }))
    }

    fn spawn_health_tasks(&self, state: &Arc<SessionState>) -> (JoinHandle<()>, JoinHandle<()>) {
        let (unhealthy_tx, unhealthy_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);

        let checker = {
            let resource_manager = self.resource_manager.clone();
            let stop = state.shutdown.clone();
            let devices = state.inventory.devices().to_vec();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = resource_manager.check_health(stop, devices, unhealthy_tx) {
                    error!("device health check failed: {e:#}");
                }
            })
        };
        let relay = tokio::spawn(relay_health(state.clone(), unhealthy_rx));
        (checker, relay)
    }
}

/// Apply health events in arrival order until the session ends.
async fn relay_health(state: Arc<SessionState>, mut unhealthy: mpsc::Receiver<String>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            event = unhealthy.recv() => match event {
                Some(physical_id) => state.mark_unhealthy(&physical_id),
                None => break,
            },
        }
    }
    debug!("health relay stopped");
}

/// Bind `socket_path` and run the gRPC server in the background. Returns
/// once the socket accepts connections.
async fn serve(
    state: Arc<SessionState>,
    socket_path: &Path,
) -> Result<JoinHandle<()>, Report<PluginError>> {
    let context = || PluginError::Serve {
        path: socket_path.to_path_buf(),
    };

    // clean up old socket file if it exists
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!("removed stale socket {}", socket_path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Report::new(e).change_context(context())),
    }

    let listener = StdUnixListener::bind(socket_path).change_context_lazy(context)?;
    listener
        .set_nonblocking(true)
        .change_context_lazy(context)?;

    let service = DevicePluginService::new(state.clone());
    let server = tokio::spawn(run_server(
        listener,
        service,
        state.shutdown.clone(),
        state.config.resource_name.clone(),
    ));

    // wait for the server to accept connections
    dial(socket_path, DIAL_TIMEOUT)
        .await
        .change_context_lazy(context)?;
    Ok(server)
}

/// Serve until shut down. Exits the process when the server keeps crashing.
async fn run_server(
    listener: StdUnixListener,
    service: DevicePluginService,
    shutdown: CancellationToken,
    resource_name: String,
) {
    let attempt = || serve_once(&listener, service.clone(), shutdown.clone());
    if let Err(e) = supervise(attempt, &shutdown, &resource_name).await {
        error!("{e:?}. Quitting");
        std::process::exit(1);
    }
    info!("GRPC server for '{resource_name}' stopped");
}

/// Run `serve` until it returns cleanly or `shutdown` is cancelled,
/// restarting it after crashes within the bounds of [`CrashLoopBreaker`].
async fn supervise<F, Fut>(
    mut serve: F,
    shutdown: &CancellationToken,
    resource_name: &str,
) -> Result<(), Report<PluginError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Report<io::Error>>>,
{
    let mut breaker = CrashLoopBreaker::new(Instant::now());
    loop {
        info!("Starting GRPC server for '{resource_name}'");
        match serve().await {
            Ok(()) => return Ok(()),
            Err(_) if shutdown.is_cancelled() => return Ok(()),
            Err(e) => {
                error!("GRPC server for '{resource_name}' crashed with error: {e:?}");
                if breaker.record_crash(Instant::now()) == CrashVerdict::GiveUp {
                    return Err(e.change_context(PluginError::CrashLoop {
                        resource_name: resource_name.to_string(),
                    }));
                }
            }
        }
    }
}

async fn serve_once(
    listener: &StdUnixListener,
    service: DevicePluginService,
    shutdown: CancellationToken,
) -> Result<(), Report<io::Error>> {
    let listener = UnixListener::from_std(listener.try_clone()?)?;
    Server::builder()
        .add_service(DevicePluginServer::new(service))
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::UnixListenerStream::new(listener),
            async move {
                shutdown.cancelled().await;
                info!("shutting down gRPC server");
            },
        )
        .await
        .map_err(|e| Report::new(io::Error::other(e)))
}

/// Connect to the gRPC server listening on the Unix socket `socket_path`.
pub async fn dial(socket_path: &Path, timeout: Duration) -> Result<Channel, Report<io::Error>> {
    let target = socket_path.to_path_buf();
    // The URL is a placeholder, the connector below always uses the socket.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let target = target.clone();
        async move { UnixStream::connect(target).await.map(TokioIo::new) }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(Report::new(io::Error::other(e))
            .attach_printable(format!("dialing {}", socket_path.display()))),
        Err(_) => Err(Report::new(io::Error::from(io::ErrorKind::TimedOut))
            .attach_printable(format!("dialing {} timed out", socket_path.display()))),
    }
}

/// Socket file name the kubelet dials, relative to its plugin directory.
fn endpoint_name(socket_path: &Path) -> String {
    socket_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
