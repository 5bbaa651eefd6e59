//! Poll-until-state coordinator shared by every backend's `container_wait`.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    /// Number of inspect calls issued, including the one that matched.
    pub polls: u32,
    pub elapsed: Duration,
}

/// Repeatedly run `inspect` until it reports `target_state`.
///
/// An inspect error counts as "not yet" and is retried. Polling stops once
/// the state matches or `timeout` has elapsed; no poll is started at or after
/// the deadline, and an inspect still in flight when the deadline passes is
/// abandoned. On timeout the most recent inspect error, if any, is carried in
/// the returned `DriverError::Timeout`.
pub async fn wait_for_state<P, Fut>(
    container: &str,
    target_state: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut inspect: P,
) -> Result<WaitReport>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut polls = 0u32;
    let mut last_error: Option<String> = None;
    let mut last_state: Option<String> = None;

    while Instant::now() < deadline {
        polls += 1;
        match tokio::time::timeout_at(deadline, inspect()).await {
            Ok(Ok(state)) if state == target_state => {
                debug!(
                    "Container {} reached '{}' after {} polls",
                    container, target_state, polls
                );
                return Ok(WaitReport {
                    polls,
                    elapsed: started.elapsed(),
                });
            }
            Ok(Ok(state)) => {
                debug!("Container {} is '{}', waiting for '{}'", container, state, target_state);
                last_state = Some(state);
            }
            Ok(Err(err)) => {
                debug!("Inspect of {} failed, retrying: {}", container, err);
                last_error = Some(err.to_string());
            }
            Err(_) => break,
        }

        tokio::time::sleep_until((Instant::now() + poll_interval).min(deadline)).await;
    }

    warn!(
        "Gave up waiting for {} to reach '{}' after {:?} (last state: {})",
        container,
        target_state,
        timeout,
        last_state.as_deref().unwrap_or("unknown")
    );
    Err(DriverError::Timeout {
        operation: "container wait",
        target: container.to_string(),
        after: timeout,
        last_error,
    })
}
