use crate::probe::LivenessProbe;
use crate::reconciler::{PassOutcome, Reconciler};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LIVENESS_POLL: Duration = Duration::from_secs(30);
pub const DEFAULT_RESTART_COOLDOWN: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Startup,
    Interval,
    LivenessEdge,
    Signal,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Interval => "interval",
            Self::LivenessEdge => "liveness_edge",
            Self::Signal => "signal",
        })
    }
}

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub interval: Duration,
    pub liveness_poll: Duration,
    pub restart_cooldown: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            liveness_poll: DEFAULT_LIVENESS_POLL,
            restart_cooldown: DEFAULT_RESTART_COOLDOWN,
        }
    }
}

/// Fires at most once per cool-down while the probe keeps reporting "up".
/// The clock only resets when it fires.
#[derive(Debug, Clone)]
pub struct EdgeDebouncer {
    cooldown: Duration,
    last_fired: Option<Instant>,
}

impl EdgeDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: None,
        }
    }

    /// Counts a run that happened outside the debouncer (the startup pass) as the last fire.
    pub fn prime(&mut self, now: Instant) {
        self.last_fired = Some(now);
    }

    pub fn observe(&mut self, up: bool, now: Instant) -> bool {
        if !up {
            return false;
        }
        if let Some(prev) = self.last_fired {
            if now.saturating_duration_since(prev) <= self.cooldown {
                return false;
            }
        }
        self.last_fired = Some(now);
        true
    }
}

pub struct TriggerController {
    reconciler: Arc<Reconciler>,
    probe: Arc<dyn LivenessProbe>,
    settings: TriggerSettings,
}

impl TriggerController {
    pub fn new(
        reconciler: Arc<Reconciler>,
        probe: Arc<dyn LivenessProbe>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            reconciler,
            probe,
            settings,
        }
    }

    /// Startup pass followed by the scheduler loop. A shutdown requested during the startup
    /// pass stops it at the next commit boundary and skips the loop.
    pub async fn serve(self, cancel: CancellationToken) {
        self.fire(TriggerSource::Startup).await;
        if cancel.is_cancelled() {
            return;
        }
        self.run(cancel).await;
    }

    /// Single scheduler loop. Passes are awaited inline, so ticks that come due during a
    /// long pass are skipped rather than queued.
    pub async fn run(self, cancel: CancellationToken) {
        let start = Instant::now();
        let mut interval =
            tokio::time::interval_at(start + self.settings.interval, self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut liveness = tokio::time::interval(self.settings.liveness_poll);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut debouncer = EdgeDebouncer::new(self.settings.restart_cooldown);
        debouncer.prime(start);
        let mut external = ExternalSignal::new();

        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            liveness_poll_secs = self.settings.liveness_poll.as_secs(),
            cooldown_secs = self.settings.restart_cooldown.as_secs(),
            "trigger controller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.fire(TriggerSource::Interval).await,
                _ = liveness.tick() => {
                    let up = self.probe.is_up().await;
                    if debouncer.observe(up, Instant::now()) {
                        tracing::info!("backend reachable after cool-down; triggering reconciliation");
                        self.fire(TriggerSource::LivenessEdge).await;
                    }
                }
                _ = external.recv() => self.fire(TriggerSource::Signal).await,
            }
        }
        tracing::info!("trigger controller stopped");
    }

    pub async fn fire(&self, source: TriggerSource) {
        tracing::debug!(%source, "reconciliation triggered");
        if let PassOutcome::Skipped = self.reconciler.run_pass().await {
            tracing::info!(%source, "reconciliation already in flight; trigger dropped");
        }
    }
}

/// SIGHUP on Unix; never fires elsewhere or if the handler cannot be installed.
struct ExternalSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ExternalSignal {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => Some(stream),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGHUP handler");
                    None
                }
            };
            Self { hangup }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if let Some(hangup) = self.hangup.as_mut() {
                if hangup.recv().await.is_some() {
                    return;
                }
                self.hangup = None;
            }
        }
        std::future::pending::<()>().await
    }
}
