use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::lifecycle::{LifecycleController, SharedClock};
use crate::registry::RoomRegistry;
use crate::relay::RelayRouter;
use crate::store::SharedSessionStore;

/// Everything a request handler or connection actor needs, cheap to clone.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub registry: RoomRegistry,
    pub router: RelayRouter,
    pub lifecycle: LifecycleController,
    pub metrics: Option<PrometheusHandle>,
    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        store: SharedSessionStore,
        clock: SharedClock,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let registry = RoomRegistry::new();
        let router = RelayRouter::new(registry.clone());
        let lifecycle =
            LifecycleController::new(registry.clone(), router.clone(), store, clock, &config);
        Self {
            config: Arc::new(config),
            registry,
            router,
            lifecycle,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }

    /// Closes every connection with `server-shutdown`. Sessions stay as they are.
    pub fn begin_shutdown(&self) -> usize {
        let closed = self.lifecycle.shutdown_all();
        self.shutdown.cancel();
        closed
    }
}
