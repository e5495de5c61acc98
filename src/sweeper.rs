//! Fixed-interval background tasks with explicit shutdown.
//!
//! A [`Sweeper`] owns one spawned tokio task that runs a [`SweepTask`] on every
//! tick. What happens when the task fails is decided by the configured
//! [`FailurePolicy`]; the current [`SweeperState`] is published on a watch
//! channel so the health endpoint can report it.

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::config::FailurePolicy;
use crate::error::GatewayError;
use crate::metrics::{SWEEPER_FAILURES, SWEEPERS_STOPPED};

#[async_trait]
pub trait SweepTask: Send + 'static {
    /// Name used in logs, metrics and the health report.
    fn name(&self) -> &'static str;

    async fn run(&mut self) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweeperState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SweeperStatus {
    name: &'static str,
    state: watch::Receiver<SweeperState>,
}

impl SweeperStatus {
    pub fn name(&self) -> &'static str {
        self.name
    }

    // a dropped sender means the loop is gone, whatever it last published
    pub fn state(&self) -> SweeperState {
        if self.state.has_changed().is_err() {
            return SweeperState::Stopped;
        }
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SweeperState::Running
    }
}

pub struct Sweeper<T: SweepTask> {
    status: SweeperStatus,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<T>,
}

impl<T: SweepTask> Sweeper<T> {
    /// Spawn the background loop. The first run happens one `period` after start.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(task: T, period: Duration, policy: FailurePolicy) -> Self {
        let name = task.name();
        let (state_tx, state_rx) = watch::channel(SweeperState::Running);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(sweeper = name, period = ?period, policy = ?policy, "Sweeper started");
        let handle = tokio::spawn(run_loop(task, period, policy, shutdown_rx, state_tx));

        Self {
            status: SweeperStatus {
                name,
                state: state_rx,
            },
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    pub fn status(&self) -> SweeperStatus {
        self.status.clone()
    }

    pub fn state(&self) -> SweeperState {
        self.status.state()
    }

    /// Stop the loop and wait for it to finish, handing back the task.
    ///
    /// Returns `None` if the task panicked.
    pub async fn shutdown(mut self) -> Option<T> {
        if let Some(tx) = self.shutdown_tx.take() {
            // the loop may already have exited under FailurePolicy::Stop
            let _ = tx.send(());
        }
        match self.handle.await {
            Ok(task) => Some(task),
            Err(e) => {
                error!(sweeper = self.status.name, error = %e, "Sweeper task did not finish cleanly");
                None
            }
        }
    }
}

// Publishes Stopped however the loop ends, including a panic inside the task
struct StoppedOnDrop(watch::Sender<SweeperState>);

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(SweeperState::Stopped);
    }
}

async fn run_loop<T: SweepTask>(
    mut task: T,
    period: Duration,
    policy: FailurePolicy,
    mut shutdown_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<SweeperState>,
) -> T {
    let _stopped = StoppedOnDrop(state_tx);
    let name = task.name();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval() completes its first tick immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Err(e) = task.run().await else {
                    continue;
                };
                SWEEPER_FAILURES.with_label_values(&[name]).inc();
                match policy {
                    FailurePolicy::Continue => {
                        warn!(sweeper = name, error = %e, "Sweep failed, will retry on next tick");
                    }
                    FailurePolicy::Stop => {
                        error!(sweeper = name, error = %e, "Sweep failed, stopping sweeper");
                        SWEEPERS_STOPPED.inc();
                        break;
                    }
                }
            }
            _ = &mut shutdown_rx => {
                info!(sweeper = name, "Sweeper shutting down");
                break;
            }
        }
    }

    task
}
