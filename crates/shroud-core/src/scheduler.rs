//! Rotation Scheduler
//!
//! Checks on a coarse tick whether the active chain is due and asks the
//! state machine to rotate it. A rotation lands within one tick after the
//! interval elapses, not exactly on it.

use crate::manager::{ConnectionError, ConnectionStateMachine, RotationOutcome};
use crate::settings::RotationSettings;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default check cadence
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// Is a chain last rotated at `last_rotation` due at `now`?
///
/// A `last_rotation` in the future (clock moved back) counts as not due.
pub fn needs_rotation(
    auto_rotate: bool,
    interval: Duration,
    last_rotation: SystemTime,
    now: SystemTime,
) -> bool {
    if !auto_rotate {
        return false;
    }
    match now.duration_since(last_rotation) {
        Ok(elapsed) => elapsed >= interval,
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct RotationScheduler {
    tick: Duration,
}

impl RotationScheduler {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }

    pub fn from_settings(settings: &RotationSettings) -> Self {
        Self::new(settings.tick())
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// One scheduler tick. Returns `None` when nothing was due.
    pub async fn check(
        &self,
        machine: &ConnectionStateMachine,
        now: SystemTime,
    ) -> Option<Result<RotationOutcome, ConnectionError>> {
        if !machine.status().needs_rotation(now) {
            return None;
        }

        debug!("Active chain due for rotation");
        let result = machine.rotate().await;
        match &result {
            Ok(RotationOutcome::Rotated { from, to }) => info!("Scheduled rotation {} -> {}", from, to),
            Ok(RotationOutcome::Skipped) => debug!("Scheduled rotation skipped"),
            Err(e) => warn!("Scheduled rotation failed: {}", e),
        }
        Some(result)
    }

    /// Run on a background task until the handle is stopped or dropped
    pub fn spawn(self, machine: Arc<ConnectionStateMachine>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.check(&machine, SystemTime::now()).await;
                    }
                }
            }
            debug!("Rotation scheduler stopped");
        });

        SchedulerHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

impl Default for RotationScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop and wait for the task to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Rotation scheduler task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    #[test]
    fn test_due_after_interval() {
        let now = SystemTime::now();
        assert!(needs_rotation(true, TEN_MINUTES, now - Duration::from_secs(11 * 60), now));
        assert!(!needs_rotation(true, TEN_MINUTES, now - Duration::from_secs(9 * 60), now));
    }

    #[test]
    fn test_exactly_at_interval() {
        let now = SystemTime::now();
        assert!(needs_rotation(true, TEN_MINUTES, now - TEN_MINUTES, now));
    }

    #[test]
    fn test_auto_rotate_off() {
        let now = SystemTime::now();
        assert!(!needs_rotation(false, TEN_MINUTES, now - Duration::from_secs(3600), now));
    }

    #[test]
    fn test_clock_skew() {
        let now = SystemTime::now();
        assert!(!needs_rotation(true, TEN_MINUTES, now + Duration::from_secs(60), now));
    }

    #[test]
    fn test_from_settings() {
        let scheduler = RotationScheduler::from_settings(&RotationSettings { tick_secs: 5 });
        assert_eq!(scheduler.tick(), Duration::from_secs(5));
        assert_eq!(RotationScheduler::default().tick(), DEFAULT_TICK);
    }
}
