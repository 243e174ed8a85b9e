//! Stream Supervisor
//!
//! Top-level control loop. Composes the reconnection manager, the tick
//! fan-out, the normalizer and the subscription multiplexer behind a small
//! API:
//!
//! - [`StreamSupervisor::start`] / [`StreamSupervisor::stop`]
//! - [`StreamSupervisor::subscribe`] for push consumers
//! - [`StreamSupervisor::tick_buffer`] for pull consumers
//! - [`StreamSupervisor::add_pair`] / [`StreamSupervisor::remove_pair`]
//! - [`StreamSupervisor::health`]
//!
//! # Shutdown
//!
//! `stop()` cancels the connection task and waits for it up to the shutdown
//! timeout, aborting it when the timeout elapses. Consumer buffers are then
//! drained or discarded according to [`ShutdownMode`] and closed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::monitor::{ConnectionMonitor, ConsumerHealth, HealthSnapshot};
use super::session::{ReconnectionManager, SessionConfig, SessionContext};
use crate::application::ports::{ProviderAdapter, TickSink, TransportConnector};
use crate::domain::buffer::{DEFAULT_BUFFER_CAPACITY, TickBuffer, TickFanout};
use crate::domain::normalizer::{DEFAULT_MAX_PRICE_AGE, TickNormalizer};
use crate::domain::subscription::{
    ChannelId, ChannelNaming, DEFAULT_MAX_PAIRS, MultiplexerError, SubscriptionChanges,
    SubscriptionMultiplexer,
};
use crate::domain::tick::CurrencyPair;
use crate::infrastructure::metrics;

/// How long a consumer thread waits before re-checking for shutdown.
const SINK_POLL_INTERVAL: Duration = Duration::from_millis(250);

// =============================================================================
// Configuration
// =============================================================================

/// What happens to buffered ticks on `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Consumers receive every buffered tick before their stream ends.
    #[default]
    Drain,
    /// Buffered ticks are dropped.
    Discard,
}

impl std::str::FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "discard" => Ok(Self::Discard),
            _ => Err(format!("unknown shutdown mode: {s}")),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pairs subscribed at construction.
    pub pairs: Vec<CurrencyPair>,
    /// Working set limit.
    pub max_pairs: usize,
    /// Capacity of each consumer buffer.
    pub buffer_capacity: usize,
    /// Maximum accepted price age (zero disables the check).
    pub max_price_age: Duration,
    /// Connection timing.
    pub session: SessionConfig,
    /// Upper bound on `stop()` before the connection task is aborted.
    pub shutdown_timeout: Duration,
    /// Buffered tick handling on `stop()`.
    pub shutdown_mode: ShutdownMode,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            max_pairs: DEFAULT_MAX_PAIRS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_price_age: DEFAULT_MAX_PRICE_AGE,
            session: SessionConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            shutdown_mode: ShutdownMode::Drain,
        }
    }
}

/// Errors surfaced by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// `start()` called while running.
    #[error("stream supervisor is already running")]
    AlreadyRunning,

    /// Pair change refused.
    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),
}

// =============================================================================
// Supervisor
// =============================================================================

/// Channel naming delegated to the provider adapter.
struct AdapterNaming(Arc<dyn ProviderAdapter>);

impl ChannelNaming for AdapterNaming {
    fn channel_id(&self, pair: &CurrencyPair) -> ChannelId {
        self.0.channel_id(pair)
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<TickNormalizer>,
}

/// Owns one provider session and the consumers fed from it.
pub struct StreamSupervisor {
    config: SupervisorConfig,
    ctx: SessionContext,
    normalizer: Mutex<Option<TickNormalizer>>,
    running: Mutex<Option<Running>>,
    sinks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("provider", &self.ctx.adapter.name())
            .field("pairs", &self.ctx.multiplexer.pairs())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl StreamSupervisor {
    /// Create a stopped supervisor subscribed to `config.pairs`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Multiplexer`] if the initial pairs exceed
    /// the working set limit.
    pub fn new(
        config: SupervisorConfig,
        adapter: Arc<dyn ProviderAdapter>,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Self, SupervisorError> {
        let naming = Arc::new(AdapterNaming(Arc::clone(&adapter)));
        let multiplexer = Arc::new(SubscriptionMultiplexer::new(naming, config.max_pairs));
        for pair in &config.pairs {
            multiplexer.add_pair(*pair)?;
        }
        metrics::set_subscribed_pairs(multiplexer.len());

        let ctx = SessionContext {
            adapter,
            connector,
            multiplexer,
            fanout: Arc::new(TickFanout::new(config.buffer_capacity)),
            monitor: Arc::new(ConnectionMonitor::new()),
            resync: Arc::new(Notify::new()),
        };
        let normalizer = TickNormalizer::new(config.max_price_age);

        Ok(Self {
            config,
            ctx,
            normalizer: Mutex::new(Some(normalizer)),
            running: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the connection task. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] if already started.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let normalizer = self.normalizer.lock().take().unwrap_or_else(|| {
            tracing::warn!(
                "Previous connection task was aborted, per-pair sequences restart at 1"
            );
            self.ctx.monitor.record_sequence_reset();
            TickNormalizer::new(self.config.max_price_age)
        });
        let cancel = CancellationToken::new();
        let manager = ReconnectionManager::new(
            self.config.session.clone(),
            self.ctx.clone(),
            normalizer,
            cancel.clone(),
        );

        tracing::info!(
            provider = self.ctx.adapter.name(),
            pairs = ?self.ctx.multiplexer.pairs(),
            "Starting stream supervisor"
        );
        *running = Some(Running {
            cancel,
            task: tokio::spawn(manager.run()),
        });
        Ok(())
    }

    /// Stop the connection task and release consumers.
    ///
    /// A no-op when already stopped.
    pub async fn stop(&self) {
        let Some(Running { cancel, mut task }) = self.running.lock().take() else {
            return;
        };
        let deadline = Instant::now() + self.config.shutdown_timeout;

        tracing::info!("Stopping stream supervisor");
        cancel.cancel();

        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(normalizer)) => {
                *self.normalizer.lock() = Some(normalizer);
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Connection task failed");
                self.ctx.monitor.force_disconnected();
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis(),
                    "Connection task did not stop in time, aborting"
                );
                task.abort();
                self.ctx.monitor.force_disconnected();
            }
        }

        if self.config.shutdown_mode == ShutdownMode::Discard {
            let discarded = self.ctx.fanout.clear_all();
            tracing::info!(discarded, "Discarded buffered ticks");
        }
        self.ctx.fanout.close_all();

        let sinks = std::mem::take(&mut *self.sinks.lock());
        for mut sink in sinks {
            if tokio::time::timeout_at(deadline, &mut sink).await.is_err() {
                tracing::warn!("Consumer did not finish draining before the shutdown timeout");
            }
        }

        for buffer in self.ctx.fanout.buffers() {
            self.ctx.fanout.unregister(&buffer);
        }
        tracing::info!("Stream supervisor stopped");
    }

    /// True between `start()` and `stop()`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Register a push consumer.
    ///
    /// The sink runs on its own blocking thread and receives ticks until the
    /// supervisor stops. Must be called inside a Tokio runtime.
    pub fn subscribe<S: TickSink>(&self, sink: S) {
        let buffer = self.ctx.fanout.register();
        let handle = tokio::task::spawn_blocking(move || run_sink(&buffer, sink));
        self.sinks.lock().push(handle);
    }

    /// Register a pull consumer and return its buffer.
    #[must_use]
    pub fn tick_buffer(&self) -> Arc<TickBuffer> {
        self.ctx.fanout.register()
    }

    /// Add a pair to the working set.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Multiplexer`] when the working set is full.
    pub fn add_pair(&self, pair: CurrencyPair) -> Result<SubscriptionChanges, SupervisorError> {
        let changes = self.ctx.multiplexer.add_pair(pair)?;
        self.after_pair_change(&changes);
        Ok(changes)
    }

    /// Remove a pair from the working set.
    pub fn remove_pair(&self, pair: CurrencyPair) -> SubscriptionChanges {
        let changes = self.ctx.multiplexer.remove_pair(pair);
        self.after_pair_change(&changes);
        changes
    }

    fn after_pair_change(&self, changes: &SubscriptionChanges) {
        metrics::set_subscribed_pairs(self.ctx.multiplexer.len());
        if !changes.is_empty() {
            self.ctx.resync.notify_one();
        }
    }

    /// Active pairs in canonical order.
    #[must_use]
    pub fn pairs(&self) -> Vec<CurrencyPair> {
        self.ctx.multiplexer.pairs()
    }

    /// Connection monitor shared with the connection task.
    #[must_use]
    pub fn monitor(&self) -> Arc<ConnectionMonitor> {
        Arc::clone(&self.ctx.monitor)
    }

    /// Current health readout.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        let consumers: Vec<ConsumerHealth> = self
            .ctx
            .fanout
            .buffers()
            .iter()
            .map(|buffer| ConsumerHealth {
                buffered: buffer.len(),
                capacity: buffer.capacity(),
                overflow: buffer.overflow_count(),
                gaps: buffer.gap_count(),
                last_gap: buffer.last_gap(),
            })
            .collect();

        HealthSnapshot {
            running: self.is_running(),
            provider: self.ctx.adapter.name(),
            pairs: self.ctx.multiplexer.pairs(),
            connection: self.ctx.monitor.connection_health(),
            overflow_total: consumers.iter().map(|c| c.overflow).sum(),
            last_gap: consumers.iter().find_map(|c| c.last_gap),
            consumers,
        }
    }
}

fn run_sink<S: TickSink>(buffer: &TickBuffer, mut sink: S) {
    loop {
        match buffer.pop_timeout(SINK_POLL_INTERVAL) {
            Some(tick) => sink.on_tick(tick),
            None if buffer.is_closed() => break,
            None => {}
        }
    }
    sink.on_close();
}

// =============================================================================
// Tests
// =============================================================================
