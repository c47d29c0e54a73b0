//! Process driver: keeps the plugin registered across kubelet restarts and
//! reload signals until asked to shut down.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::allocation::SimplePolicy;
use crate::config::AllocationPolicyKind;
use crate::config::Config;
use crate::device_plugin::GpuDevicePlugin;
use crate::nvml::NvmlResourceManager;
use crate::resource::AllocationPolicy;

/// Delay before retrying a plugin that failed to start.
const RESTART_RETRY: Duration = Duration::from_secs(30);

pub async fn run(config: Config) -> Result<()> {
    let resource_manager = match NvmlResourceManager::init() {
        Ok(resource_manager) => Arc::new(resource_manager),
        Err(e) if !config.fail_on_init_error => {
            tracing::error!("{e:#}; fail-on-init-error is false, waiting for a shutdown signal");
            wait_for_shutdown().await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let policy: Option<Arc<dyn AllocationPolicy>> = match config.allocation_policy {
        AllocationPolicyKind::Simple => Some(Arc::new(SimplePolicy)),
        AllocationPolicyKind::Disabled => None,
    };

    let mut plugin = GpuDevicePlugin::new(config, resource_manager, policy);
    run_plugin(&mut plugin).await
}

/// Run `plugin` until SIGINT or SIGTERM. It is restarted on SIGHUP and
/// whenever the kubelet socket is re-created.
pub async fn run_plugin(plugin: &mut GpuDevicePlugin) -> Result<()> {
    let (restart_tx, restart_rx) = mpsc::channel(8);
    // dropping the watcher stops it
    let _watcher = watch_kubelet_socket(
        plugin.config().kubelet_socket_path.clone(),
        restart_tx.clone(),
    )?;

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(forward_signals(
        signal(SignalKind::hangup())?,
        signal(SignalKind::terminate())?,
        signal(SignalKind::interrupt())?,
        restart_tx,
        shutdown.clone(),
    ));

    let result = run_until(plugin, restart_rx, shutdown).await;
    signals.abort();
    result
}

/// Keep `plugin` serving until `shutdown` is cancelled. Every message on
/// `restarts` restarts it, and a plugin that failed to start is retried
/// after [`RESTART_RETRY`].
pub async fn run_until(
    plugin: &mut GpuDevicePlugin,
    mut restarts: mpsc::Receiver<()>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        if let Err(e) = plugin.stop().await {
            tracing::warn!("failed to stop device plugin: {e:?}");
        }
        if let Err(e) = plugin.start().await {
            tracing::error!("Failed to start device plugin, retrying in {RESTART_RETRY:?}: {e:?}");
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(()) = restarts.recv() => tracing::info!("restarting device plugin"),
            _ = tokio::time::sleep(RESTART_RETRY), if !plugin.is_serving() => {}
        }
    }

    plugin
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to stop device plugin")
}

async fn forward_signals(
    mut sighup: Signal,
    mut sigterm: Signal,
    mut sigint: Signal,
    restarts: mpsc::Sender<()>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                tracing::info!("Received SIGHUP, restarting device plugin");
                let _ = restarts.try_send(());
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
        }
    }
    shutdown.cancel();
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

/// Notify `tx` whenever `kubelet_socket` is created, which happens when the
/// kubelet restarts and forgets all registered plugins.
fn watch_kubelet_socket(
    kubelet_socket: PathBuf,
    tx: mpsc::Sender<()>,
) -> Result<RecommendedWatcher> {
    let dir = kubelet_socket
        .parent()
        .map(Path::to_path_buf)
        .context("kubelet socket path has no parent directory")?;

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) if is_socket_created(&event, &kubelet_socket) => {
                tracing::info!("kubelet socket re-created, restarting device plugin");
                // a restart is already pending when the channel is full
                let _ = tx.try_send(());
            }
            Ok(event) => tracing::trace!("ignoring filesystem event: {event:?}"),
            Err(e) => tracing::error!("Filesystem watch error: {e:?}"),
        },
        notify::Config::default(),
    )
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    tracing::info!("watching {} for kubelet restarts", dir.display());
    Ok(watcher)
}

fn is_socket_created(event: &Event, socket: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|p| p == socket)
}

#[cfg(test)]
mod tests {
    use notify::event::CreateKind;
    use notify::event::RemoveKind;

    use super::*;

    const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

    #[test]
    fn kubelet_socket_creation_triggers_restart() {
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(KUBELET_SOCKET.into());
        assert!(is_socket_created(&event, Path::new(KUBELET_SOCKET)));
    }

    #[test]
    fn other_sockets_and_removals_are_ignored() {
        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path("/var/lib/kubelet/device-plugins/nvidia-gpu.sock".into());
        assert!(!is_socket_created(&other, Path::new(KUBELET_SOCKET)));

        let removed =
            Event::new(EventKind::Remove(RemoveKind::File)).add_path(KUBELET_SOCKET.into());
        assert!(!is_socket_created(&removed, Path::new(KUBELET_SOCKET)));
    }
}
