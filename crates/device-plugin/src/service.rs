use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::allocation::Allocator;
use crate::api::device_plugin_server::DevicePlugin;
use crate::api::AllocateRequest;
use crate::api::AllocateResponse;
use crate::api::DevicePluginOptions;
use crate::api::Empty;
use crate::api::ListAndWatchResponse;
use crate::api::PreStartContainerRequest;
use crate::api::PreStartContainerResponse;
use crate::api::PreferredAllocationRequest;
use crate::api::PreferredAllocationResponse;
use crate::device_plugin::SessionState;
use crate::resource::Device;

/// DevicePlugin service implementation, one per serving session.
#[derive(Clone)]
pub(crate) struct DevicePluginService {
    state: Arc<SessionState>,
}

impl DevicePluginService {
    pub fn new(state: Arc<SessionState>) -> Self {
        Self { state }
    }

    fn allocator(&self) -> Allocator<'_> {
        Allocator::new(
            &self.state.config,
            &self.state.inventory,
            self.state.policy.as_deref(),
        )
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(self.state.options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the full device list now and again after every health change.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut updates = self.state.snapshot.subscribe();
        let shutdown = self.state.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let devices = updates
                    .borrow_and_update()
                    .iter()
                    .map(Device::to_api)
                    .collect();
                if tx.send(Ok(ListAndWatchResponse { devices })).is_err() {
                    debug!("device list watcher went away");
                    return;
                }

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => {
                        debug!("device list watcher went away");
                        return;
                    }
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("device watch task stopped");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        self.allocator()
            .preferred_allocation(&req)
            .map(Response::new)
            .map_err(|e| {
                warn!("preferred allocation failed: {e}");
                Status::from(e)
            })
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to containers: {:?}", req);

        self.allocator()
            .allocate(&req)
            .map(Response::new)
            .map_err(|e| {
                warn!("allocation failed: {e}");
                Status::from(e)
            })
    }

    /// No pre-start work is needed.
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
