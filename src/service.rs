//! Owns the registry, the counters and both sweepers for one gateway instance.

use axum::{Router, middleware::from_fn_with_state, routing::get};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::counters::{CounterAggregator, CounterFlush};
use crate::error::{GatewayError, Result};
use crate::handlers::{health_handler, metrics_handler, stats_handler, view_handler, welcome_handler};
use crate::middleware::admission;
use crate::rate_limit::{RegistrySweep, VisitorRegistry};
use crate::state::AppState;
use crate::store::CounterStore;
use crate::sweeper::{SweepTask, Sweeper, SweeperStatus};

pub struct Gateway {
    state: Arc<AppState>,
    visitor_sweeper: Sweeper<RegistrySweep>,
    counter_flusher: Sweeper<CounterFlush>,
}

impl Gateway {
    /// Validate `config`, build the shared state and start both sweepers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &GatewayConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(VisitorRegistry::new(config.bucket_capacity, config.refill_rate));
        let counters = Arc::new(CounterAggregator::new());

        let visitor_sweeper = Sweeper::start(
            RegistrySweep::new(registry.clone(), config.stale_after),
            config.sweep_interval,
            config.failure_policy,
        );
        let counter_flusher = Sweeper::start(
            CounterFlush::new(counters.clone(), store, config.max_pending_entries),
            config.flush_interval,
            config.failure_policy,
        );

        let state = Arc::new(AppState {
            registry,
            counters,
            click_probability: config.click_probability,
            sweepers: vec![visitor_sweeper.status(), counter_flusher.status()],
        });

        Ok(Self {
            state,
            visitor_sweeper,
            counter_flusher,
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(welcome_handler))
            .route("/view", get(view_handler))
            .route("/view/", get(view_handler))
            .route("/stats", get(stats_handler))
            .route("/stats/", get(stats_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(from_fn_with_state(self.state.registry.clone(), admission))
    }

    pub fn registry(&self) -> &Arc<VisitorRegistry> {
        &self.state.registry
    }

    pub fn counters(&self) -> &Arc<CounterAggregator> {
        &self.state.counters
    }

    pub fn sweepers(&self) -> &[SweeperStatus] {
        &self.state.sweepers
    }

    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await?;

        self.shutdown().await
    }

    /// Stop both sweepers and flush whatever was counted since the last tick.
    ///
    /// Fails if the final upload fails or if either sweeper did not finish
    /// cleanly. Counts held by a flusher that panicked are lost.
    pub async fn shutdown(self) -> Result<()> {
        let sweep = self.visitor_sweeper.shutdown().await;

        let Some(mut flush) = self.counter_flusher.shutdown().await else {
            error!("Counter flusher did not finish, remaining counters were not flushed");
            return Err(GatewayError::Task("counter-flush".into()));
        };
        info!("Flushing remaining counters");
        flush.run().await?;

        if sweep.is_none() {
            return Err(GatewayError::Task("visitor-sweep".into()));
        }
        info!("Gateway stopped");
        Ok(())
    }
}
