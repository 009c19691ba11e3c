//! Session supervisor.
//!
//! Runs sessions back to back until stopped:
//!
//! ```text
//! Idle → Connecting → Configuring → Forwarding ─┬→ Retrying → Connecting …
//!                                               └→ Terminated
//! ```
//!
//! Any failure before or during forwarding closes the session's resources
//! and, after a fixed delay, starts a new session from scratch. There is no
//! backoff growth and no retry cap. Only the stop signal ends the loop.

use crate::error::BridgeError;
use crate::forwarder::Forwarder;
use crate::session::{DeviceHalves, SessionBackend, TransportHalves};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Configuring,
    Forwarding,
    Retrying,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Configuring => "configuring",
            Self::Forwarding => "forwarding",
            Self::Retrying => "retrying",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Level-triggered stop request.
///
/// Once the sender publishes `true` every clone observes it, now and later.
/// Sending again is harmless.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Create a stop signal and the sender that triggers it.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop has been requested.
    ///
    /// If the sender is dropped without requesting stop, this never resolves.
    pub async fn wait(&mut self) {
        let stopped = self.rx.wait_for(|stopped| *stopped).await.is_ok();
        if !stopped {
            std::future::pending::<()>().await;
        }
    }
}

/// Counters kept across the supervisor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Sessions started (connect attempts).
    pub attempts: u64,
    /// Retry delays entered.
    pub retries: u64,
    /// Sessions that reached forwarding.
    pub sessions: u64,
}

enum SessionOutcome {
    Failed(BridgeError),
    Stopped,
}

/// Drives sessions from a [`SessionBackend`] until stopped.
pub struct Supervisor<B> {
    backend: B,
    retry_interval: Duration,
    stop: StopSignal,
    state: watch::Sender<SupervisorState>,
    stats: SupervisorStats,
}

impl<B: SessionBackend> Supervisor<B> {
    pub fn new(backend: B, retry_interval: Duration, stop: StopSignal) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            backend,
            retry_interval,
            stop,
            state,
            stats: SupervisorStats::default(),
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Run until the stop signal is observed.
    ///
    /// Session failures never end the loop; they are logged and retried.
    pub async fn run(mut self) -> SupervisorStats {
        loop {
            if self.stop.is_stopped() {
                break;
            }

            self.stats.attempts += 1;
            match self.run_session().await {
                SessionOutcome::Stopped => break,
                SessionOutcome::Failed(err) => {
                    log::warn!("Session {} failed: {}", self.stats.attempts, err);
                }
            }

            if self.stop.is_stopped() {
                break;
            }

            set_state(&self.state, SupervisorState::Retrying);
            self.stats.retries += 1;
            log::info!("Retrying in {:?}", self.retry_interval);

            let stopped = tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => false,
                _ = self.stop.wait() => true,
            };
            if stopped {
                break;
            }
        }

        set_state(&self.state, SupervisorState::Terminated);
        log::info!(
            "Supervisor stopped after {} attempts ({} retries, {} sessions forwarded)",
            self.stats.attempts,
            self.stats.retries,
            self.stats.sessions
        );
        self.stats
    }

    /// One session: establish, configure, forward, tear down.
    async fn run_session(&mut self) -> SessionOutcome {
        let backend = &self.backend;
        let state = &self.state;
        let stop = &mut self.stop;

        let setup = async {
            set_state(state, SupervisorState::Connecting);
            let transport = backend.establish().await?;

            set_state(state, SupervisorState::Configuring);
            // `transport` is dropped if the device cannot be prepared.
            let device = backend.prepare_device().await?;
            Ok::<_, BridgeError>((transport, device))
        };

        // Dropping the setup future on stop closes whatever it had opened.
        let (transport, device): (TransportHalves, DeviceHalves) = tokio::select! {
            res = setup => match res {
                Ok(halves) => halves,
                Err(err) => return SessionOutcome::Failed(err),
            },
            _ = stop.wait() => return SessionOutcome::Stopped,
        };

        set_state(state, SupervisorState::Forwarding);
        self.stats.sessions += 1;
        log::info!("Forwarding frames between {} and host proxy", device.name);

        let mut forwarder = Forwarder::spawn(
            device.reader,
            device.writer,
            transport.reader,
            transport.writer,
        );

        let outcome = tokio::select! {
            err = forwarder.wait_failure() => SessionOutcome::Failed(err),
            _ = stop.wait() => SessionOutcome::Stopped,
        };

        forwarder.shutdown().await;
        outcome
    }
}

fn set_state(state: &watch::Sender<SupervisorState>, next: SupervisorState) {
    let prev = state.send_replace(next);
    if prev != next {
        log::info!("Supervisor: {} -> {}", prev, next);
    }
}
