//! Owner-held timer slots for deferred actions
//!
//! A [`ScheduledTask`] holds at most one pending timer. Arming aborts the
//! previous timer before spawning the new one, and every wake-up carries a
//! [`TimerToken`] the owner must hand back to [`ScheduledTask::complete`].
//! A wake-up that raced a cancel or a re-arm carries a stale token and is
//! refused, so at most one deferred action per slot ever takes effect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Identifies one arming of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    generation: u64,
}

/// Callback invoked when a timer fires
pub type Wakeup = Arc<dyn Fn(TimerToken) + Send + Sync>;

/// A single timer slot owned by a state holder
pub struct ScheduledTask {
    label: &'static str,
    wakeup: Wakeup,
    handle: Option<JoinHandle<()>>,
    generation: u64,
    deadline: Option<Instant>,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("label", &self.label)
            .field("generation", &self.generation)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl ScheduledTask {
    /// Create an idle slot. `wakeup` runs on the tokio runtime when a timer fires.
    pub fn new(label: &'static str, wakeup: Wakeup) -> Self {
        Self {
            label,
            wakeup,
            handle: None,
            generation: 0,
            deadline: None,
        }
    }

    /// Arm the slot, replacing any pending timer. Must run inside a tokio runtime.
    pub fn arm(&mut self, delay: Duration) -> TimerToken {
        self.cancel();
        self.generation += 1;
        let token = TimerToken {
            generation: self.generation,
        };

        let wakeup = Arc::clone(&self.wakeup);
        let label = self.label;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::debug!(target: "automation::timer", "{} timer fired", label);
            wakeup(token);
        }));
        self.deadline = Instant::now().checked_add(delay);

        tracing::debug!(
            target: "automation::timer",
            "Armed {} timer (in {:?})",
            self.label,
            delay
        );
        token
    }

    /// Abort the pending timer, if any
    pub fn cancel(&mut self) -> bool {
        self.deadline = None;
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                tracing::debug!(target: "automation::timer", "Cancelled {} timer", self.label);
                true
            }
            None => false,
        }
    }

    /// Accept a wake-up. Returns `false` for stale tokens, leaving the slot as is.
    pub fn complete(&mut self, token: TimerToken) -> bool {
        if self.handle.is_none() || token.generation != self.generation {
            tracing::debug!(
                target: "automation::timer",
                "Ignoring stale {} timer wake-up",
                self.label
            );
            return false;
        }
        self.handle = None;
        self.deadline = None;
        true
    }

    #[must_use] pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }

    #[must_use] pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn slot() -> (ScheduledTask, mpsc::UnboundedReceiver<TimerToken>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let wakeup: Wakeup = Arc::new(move |token: TimerToken| {
            let _ = tx.send(token);
        });
        (ScheduledTask::new("test", wakeup), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (mut task, mut rx) = slot();
        let token = task.arm(Duration::from_millis(100));
        assert!(task.is_pending());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let fired = rx.try_recv().unwrap();
        assert_eq!(fired, token);
        assert!(task.complete(fired));
        assert!(!task.is_pending());
        assert!(!task.complete(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let (mut task, mut rx) = slot();
        let first = task.arm(Duration::from_millis(50));
        let second = task.arm(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let fired = rx.try_recv().unwrap();
        assert_eq!(fired, second);
        assert!(rx.try_recv().is_err());

        // A wake-up from the replaced arming is refused
        assert!(!task.complete(first));
        assert!(task.complete(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (mut task, mut rx) = slot();
        task.arm(Duration::from_millis(10));
        assert!(task.cancel());
        assert!(!task.cancel());
        assert!(task.deadline().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
