//! Image pull progress tracking and the stall watchdog.
//!
//! The decode loop records every progress event; a background ticker reads
//! the time of the latest one and cancels the pull once it is older than the
//! stall deadline.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WatchdogSettings;
use crate::error::{DriverError, Result};

/// One decoded progress message from a pull response stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PullEvent {
    /// Layer or image the event refers to.
    pub id: Option<String>,
    pub status: String,
    pub progress: Option<ProgressDetail>,
    /// Set when the engine reports a failure inside the stream.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetail {
    pub current: i64,
    pub total: Option<i64>,
}

impl PullEvent {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ProgressDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) if total > 0 => {
                let percent = (self.current as f64 / total as f64 * 100.0).min(100.0);
                write!(f, "{}/{} ({:.0}%)", self.current, total, percent)
            }
            _ => write!(f, "{}", self.current),
        }
    }
}

impl fmt::Display for PullEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.id {
            write!(f, "{}: ", id)?;
        }
        match &self.progress {
            Some(progress) => write!(f, "{} {}", self.status, progress),
            None => write!(f, "{}", self.status),
        }
    }
}

#[derive(Debug)]
struct ProgressState {
    message: Option<PullEvent>,
    timestamp: Instant,
    recorded_at: DateTime<Utc>,
}

/// Latest progress message, shared between the decode loop and the watchdog
#[derive(Debug)]
pub struct Progress {
    state: RwLock<ProgressState>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ProgressState {
                message: None,
                timestamp: Instant::now(),
                recorded_at: Utc::now(),
            }),
        }
    }

    pub async fn set(&self, event: PullEvent) {
        let mut state = self.state.write().await;
        state.message = Some(event);
        state.timestamp = Instant::now();
        state.recorded_at = Utc::now();
    }

    /// Rendered latest message and the instant it was recorded.
    pub async fn get(&self) -> (String, Instant) {
        let state = self.state.read().await;
        let rendered = match &state.message {
            Some(event) => event.to_string(),
            None => "No progress".to_string(),
        };
        (rendered, state.timestamp)
    }

    /// Wall-clock time of the latest update.
    pub async fn recorded_at(&self) -> DateTime<Utc> {
        self.state.read().await.recorded_at
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// How a watchdog ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Stop signal arrived first; the pull finished on its own.
    Stopped,
    /// No progress for longer than the stall deadline; cancellation was invoked.
    Cancelled {
        stalled_for: Duration,
        last_progress: String,
    },
}

/// Background stall checker for one pull
pub struct ProgressReporter {
    progress: Arc<Progress>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<WatchdogOutcome>,
}

impl ProgressReporter {
    /// Spawn the watchdog. `cancel` runs at most once, when the pull stalls.
    pub fn start<C>(image: &str, settings: WatchdogSettings, cancel: C) -> Self
    where
        C: FnOnce() + Send + 'static,
    {
        let progress = Arc::new(Progress::new());
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let image = image.to_string();
        let shared = progress.clone();
        let mut cancel = Some(cancel);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                Instant::now() + settings.check_interval,
                settings.check_interval,
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (last_progress, timestamp) = shared.get().await;
                        let stalled_for = timestamp.elapsed();
                        if stalled_for > settings.stall_deadline {
                            warn!(
                                "Cancel pulling image {:?} because of no progress for {:?}, latest progress: {:?}",
                                image, settings.stall_deadline, last_progress
                            );
                            if let Some(cancel) = cancel.take() {
                                cancel();
                            }
                            return WatchdogOutcome::Cancelled { stalled_for, last_progress };
                        }
                        debug!("Pulling image {:?}: {:?}", image, last_progress);
                    }
                    // A dropped reporter counts as a stop signal.
                    _ = &mut stop_rx => {
                        let (last_progress, _) = shared.get().await;
                        debug!("Stop pulling image {:?}: {:?}", image, last_progress);
                        return WatchdogOutcome::Stopped;
                    }
                }
            }
        });

        Self {
            progress,
            stop_tx,
            task,
        }
    }

    pub async fn set(&self, event: PullEvent) {
        self.progress.set(event).await;
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    /// Signal the watchdog and wait for it to exit.
    pub async fn stop(self) -> WatchdogOutcome {
        let _ = self.stop_tx.send(());
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Pull watchdog task failed: {}", err);
                WatchdogOutcome::Stopped
            }
        }
    }
}

/// Summary of a pull that completed without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub events: usize,
    pub last_status: Option<String>,
}

/// Drive a pull's progress stream to completion under a stall watchdog.
///
/// The loop ends on end-of-stream (success), on a stream error, on an error
/// field inside a decoded event, or when the watchdog cancels. A watchdog
/// cancellation surfaces as `DriverError::Timeout`. The watchdog has always
/// exited by the time this returns.
pub async fn watch_pull<S>(reference: &str, settings: WatchdogSettings, events: S) -> Result<PullReport>
where
    S: Stream<Item = Result<PullEvent>>,
{
    let (cancel_tx, mut cancelled) = watch::channel(false);
    let reporter = ProgressReporter::start(reference, settings, move || {
        let _ = cancel_tx.send(true);
    });

    let mut events = std::pin::pin!(events);
    let mut count = 0usize;
    let mut last_status = None;

    let result = loop {
        tokio::select! {
            biased;
            // Resolve to a plain bool so no `watch::Ref` lives across the loop body.
            true = async { cancelled.wait_for(|cancelled| *cancelled).await.is_ok() } => {
                break Err(DriverError::Timeout {
                    operation: "image pull",
                    target: reference.to_string(),
                    after: settings.stall_deadline,
                    last_error: Some("context canceled: no pull progress".to_string()),
                });
            }
            next = events.next() => match next {
                None => break Ok(()),
                Some(Err(err)) => break Err(err),
                Some(Ok(event)) => {
                    if let Some(message) = &event.error {
                        break Err(DriverError::engine("image pull", reference, message.clone()));
                    }
                    count += 1;
                    last_status = Some(event.status.clone());
                    reporter.set(event).await;
                }
            }
        }
    };

    match reporter.stop().await {
        WatchdogOutcome::Cancelled { stalled_for, .. } if result.is_ok() => {
            // Stream ended right as the watchdog fired; the pull still finished.
            debug!("Pull of {} finished just after a stall of {:?}", reference, stalled_for);
        }
        _ => {}
    }

    result?;
    info!("⬇️  Pulled image {} ({} progress events)", reference, count);
    Ok(PullReport {
        events: count,
        last_status,
    })
}
