//! Actuator write debouncing
//!
//! Decides whether an incoming on/off write reaches the device, tracks the
//! value of a write whose confirmation is still outstanding, and owns the
//! deferred turn-off timer.

use crate::command::{Command, CommandSource};
use crate::timer::{ScheduledTask, TimerToken, Wakeup};
use device_core::ActuatorDriver;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Why a write was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Automatic write during a block window
    Locked,
    /// Desired value already confirmed and nothing in flight
    Unchanged,
}

impl IgnoreReason {
    #[must_use] pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a write request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Write(bool),
    Rejected(IgnoreReason),
}

/// Per-device write state
#[derive(Debug)]
pub struct ActuatorDebouncer {
    confirmed: Option<bool>,
    queued: Option<bool>,
    turn_off: ScheduledTask,
    /// Write that armed the pending turn-off
    turn_off_origin: Option<Arc<Command>>,
}

impl ActuatorDebouncer {
    /// `wakeup` is called when the turn-off timer fires; the owner passes the
    /// token back to [`Self::turn_off_due`].
    pub fn new(wakeup: Wakeup) -> Self {
        Self {
            confirmed: None,
            queued: None,
            turn_off: ScheduledTask::new("turn-off", wakeup),
            turn_off_origin: None,
        }
    }

    /// Last state confirmed by the device
    #[must_use] pub fn confirmed_state(&self) -> Option<bool> {
        self.confirmed
    }

    /// Value of the write still awaiting confirmation
    #[must_use] pub fn queued_value(&self) -> Option<bool> {
        self.queued
    }

    /// Most recent intent: the queued value, else the confirmed state
    #[must_use] pub fn desired_state(&self) -> Option<bool> {
        self.queued.or(self.confirmed)
    }

    /// Value a toggle resolves to
    #[must_use] pub fn toggle_target(&self) -> bool {
        !self.desired_state().unwrap_or(false)
    }

    #[must_use] pub fn turn_off_pending(&self) -> bool {
        self.turn_off.is_pending()
    }

    /// Decide without side effects
    #[must_use] pub fn decide(&self, command: &Command, desired: bool, locked_until: Option<Instant>) -> WriteDecision {
        let forced = command.is_force();
        if !forced && locked_until.is_some_and(|until| Instant::now() < until) {
            return WriteDecision::Rejected(IgnoreReason::Locked);
        }
        if !forced && self.queued.is_none() && self.confirmed == Some(desired) {
            return WriteDecision::Rejected(IgnoreReason::Unchanged);
        }
        WriteDecision::Write(desired)
    }

    /// Decide and, when accepted, queue the value, write it and re-arm the turn-off timer
    pub fn submit(
        &mut self,
        command: &Arc<Command>,
        desired: bool,
        timeout: Option<Duration>,
        locked_until: Option<Instant>,
        driver: &dyn ActuatorDriver,
    ) -> WriteDecision {
        let decision = self.decide(command, desired, locked_until);
        match decision {
            WriteDecision::Rejected(reason) => {
                command.ignore(reason.as_str());
                tracing::debug!(
                    target: "automation::actuator",
                    "Write on={} ignored ({}): {}",
                    desired,
                    reason,
                    command.trace()
                );
            }
            WriteDecision::Write(value) => {
                self.queued = Some(value);
                if let Err(e) = driver.write_state(value) {
                    // The queued value stays until confirmed or overwritten
                    tracing::error!(target: "automation::actuator", "Write on={} failed: {}", value, e);
                } else {
                    tracing::debug!(
                        target: "automation::actuator",
                        "Writing on={}: {}",
                        value,
                        command.trace()
                    );
                }

                self.turn_off.cancel();
                self.turn_off_origin = None;
                if let Some(timeout) = timeout.filter(|t| value && !t.is_zero()) {
                    self.turn_off.arm(timeout);
                    self.turn_off_origin = Some(Arc::clone(command));
                }
            }
        }
        decision
    }

    /// Record a state echoed back by the device. Clears the queued value.
    pub fn confirm(&mut self, on: bool) {
        if let Some(queued) = self.queued.take() {
            if queued != on {
                tracing::debug!(
                    target: "automation::actuator",
                    "Device confirmed on={} while on={} was queued",
                    on,
                    queued
                );
            }
        }
        self.confirmed = Some(on);
    }

    /// Handle a turn-off timer wake-up. Returns the forced off command to dispatch.
    pub fn turn_off_due(&mut self, token: TimerToken) -> Option<Arc<Command>> {
        if !self.turn_off.complete(token) {
            return None;
        }
        let off = match self.turn_off_origin.take() {
            Some(origin) => Command::set_actuator_state(&origin, false, "turn-off timeout"),
            None => Command::set_actuator_state(CommandSource::Force, false, "turn-off timeout"),
        };
        Some(Arc::new(off.with_override(CommandSource::Force)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_core::DriverError;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingDriver {
        writes: Mutex<Vec<bool>>,
        fail: bool,
    }

    impl RecordingDriver {
        fn writes(&self) -> Vec<bool> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl ActuatorDriver for RecordingDriver {
        fn write_state(&self, on: bool) -> Result<(), DriverError> {
            self.writes.lock().unwrap().push(on);
            if self.fail {
                return Err(DriverError::Unavailable("lamp".into()));
            }
            Ok(())
        }
    }

    fn debouncer() -> (ActuatorDebouncer, mpsc::UnboundedReceiver<TimerToken>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let wakeup: Wakeup = Arc::new(move |token: TimerToken| {
            let _ = tx.send(token);
        });
        (ActuatorDebouncer::new(wakeup), rx)
    }

    fn set(source: CommandSource, on: bool) -> Arc<Command> {
        Arc::new(Command::set_actuator_state(source, on, "test"))
    }

    #[tokio::test]
    async fn test_repeated_write_is_written_once() {
        let (mut debouncer, _rx) = debouncer();
        let driver = RecordingDriver::default();

        let first = set(CommandSource::Automatic, true);
        assert_eq!(debouncer.submit(&first, true, None, None, &driver), WriteDecision::Write(true));
        debouncer.confirm(true);

        let second = set(CommandSource::Automatic, true);
        assert_eq!(
            debouncer.submit(&second, true, None, None, &driver),
            WriteDecision::Rejected(IgnoreReason::Unchanged)
        );
        assert_eq!(second.ignore_reason(), Some("unchanged"));
        assert_eq!(driver.writes(), vec![true]);
    }

    #[tokio::test]
    async fn test_write_while_queued_is_not_dropped() {
        let (mut debouncer, _rx) = debouncer();
        let driver = RecordingDriver::default();
        debouncer.confirm(true);

        debouncer.submit(&set(CommandSource::Automatic, false), false, None, None, &driver);
        // Confirmation of the off write has not arrived yet
        let again = set(CommandSource::Automatic, true);
        assert_eq!(debouncer.submit(&again, true, None, None, &driver), WriteDecision::Write(true));
        assert_eq!(driver.writes(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_force_bypasses_unchanged_and_lock() {
        let (mut debouncer, _rx) = debouncer();
        let driver = RecordingDriver::default();
        debouncer.confirm(true);
        let lock = Some(Instant::now() + Duration::from_secs(60));

        let forced = set(CommandSource::Force, true);
        assert_eq!(debouncer.submit(&forced, true, None, lock, &driver), WriteDecision::Write(true));
        assert!(forced.ignore_reason().is_none());
    }

    #[tokio::test]
    async fn test_lock_rejects_automatic() {
        let (debouncer, _rx) = debouncer();
        let lock = Some(Instant::now() + Duration::from_secs(60));
        let cmd = set(CommandSource::Automatic, true);
        assert_eq!(
            debouncer.decide(&cmd, true, lock),
            WriteDecision::Rejected(IgnoreReason::Locked)
        );

        // An elapsed lock does not apply
        let cmd = set(CommandSource::Automatic, true);
        assert_eq!(debouncer.decide(&cmd, true, Some(Instant::now())), WriteDecision::Write(true));
    }

    #[tokio::test]
    async fn test_toggle_uses_queued_value() {
        let (mut debouncer, _rx) = debouncer();
        let driver = RecordingDriver::default();
        debouncer.confirm(false);

        let target = debouncer.toggle_target();
        assert!(target);
        debouncer.submit(&set(CommandSource::Manual, target), target, None, None, &driver);

        let target = debouncer.toggle_target();
        assert!(!target);
        debouncer.submit(&set(CommandSource::Manual, target), target, None, None, &driver);

        assert_eq!(debouncer.queued_value(), Some(false));
        assert_eq!(driver.writes(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_confirmation_clears_queue_even_on_mismatch() {
        let (mut debouncer, _rx) = debouncer();
        let driver = RecordingDriver::default();
        debouncer.submit(&set(CommandSource::Manual, true), true, None, None, &driver);
        assert_eq!(debouncer.queued_value(), Some(true));

        debouncer.confirm(false);
        assert_eq!(debouncer.queued_value(), None);
        assert_eq!(debouncer.confirmed_state(), Some(false));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_queued_value() {
        let (mut debouncer, _rx) = debouncer();
        let driver = RecordingDriver {
            fail: true,
            ..Default::default()
        };
        let decision = debouncer.submit(&set(CommandSource::Manual, true), true, None, None, &driver);
        assert_eq!(decision, WriteDecision::Write(true));
        assert_eq!(debouncer.queued_value(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_off_timer_issues_forced_off() {
        let (mut debouncer, mut rx) = debouncer();
        let driver = RecordingDriver::default();
        let on = set(CommandSource::Automatic, true);
        debouncer.submit(&on, true, Some(Duration::from_millis(100)), None, &driver);
        assert!(debouncer.turn_off_pending());

        tokio::time::sleep(Duration::from_millis(101)).await;
        let off = debouncer.turn_off_due(rx.try_recv().unwrap()).unwrap();
        assert!(off.is_force());
        assert!(off.parent().is_some());
        assert!(!debouncer.turn_off_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_write_cancels_turn_off_timer() {
        let (mut debouncer, mut rx) = debouncer();
        let driver = RecordingDriver::default();
        debouncer.submit(&set(CommandSource::Manual, true), true, Some(Duration::from_millis(100)), None, &driver);
        debouncer.submit(&set(CommandSource::Manual, false), false, Some(Duration::from_millis(100)), None, &driver);
        assert!(!debouncer.turn_off_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
