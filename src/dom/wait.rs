use super::{Document, NodeId, next_batch};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;

/// Bounds for [`wait_for`]: a poll tick that gives up after `max_attempts`,
/// and a hard `deadline` that also ends the mutation subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOptions {
    pub tick: Duration,
    pub max_attempts: u32,
    pub deadline: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            max_attempts: 15,
            deadline: Duration::from_millis(1500),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Found(T),
    /// `scope` left the document before the check succeeded.
    Detached,
    TimedOut,
    Cancelled,
}

/// Run `check` until it yields a value, re-checking after every mutation
/// batch and on each poll tick.
pub async fn wait_for<T, F>(
    doc: &Document,
    scope: NodeId,
    cancel: &CancellationToken,
    options: WaitOptions,
    mut check: F,
) -> WaitOutcome<T>
where
    F: FnMut() -> Option<T>,
{
    let mut mutations = doc.subscribe();
    let deadline = Instant::now() + options.deadline;
    let mut ticker = interval(options.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    let mut attempts = 0;
    let mut subscribed = true;

    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if !doc.is_connected(scope) {
            return WaitOutcome::Detached;
        }
        if let Some(found) = check() {
            return WaitOutcome::Found(found);
        }

        let polling = attempts < options.max_attempts;
        if !polling && !subscribed {
            return WaitOutcome::TimedOut;
        }

        tokio::select! {
            _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            _ = sleep_until(deadline) => return WaitOutcome::TimedOut,
            _ = ticker.tick(), if polling => attempts += 1,
            batch = next_batch(&mut mutations), if subscribed => {
                if batch.is_none() {
                    subscribed = false;
                }
            }
        }
    }
}
