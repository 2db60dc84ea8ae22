//! Block-automatic arbitration
//!
//! Each device owns one [`BlockAutomaticHandler`]. While a block is active,
//! automatic commands are rejected by the device. The handler moves between
//! two states:
//!
//! - Unblocked: no deadline, or the deadline has passed
//! - Blocked: `blocked_until` lies in the future and a restore timer is armed
//!
//! When the restore timer fires, or the block is lifted explicitly, the
//! handler returns a RestoreAutomaticValue command if the block was set to
//! revert on lift. The owner dispatches that command.

use crate::collision::{CollisionPolicy, Resolution};
use crate::command::{Command, CommandPayload, CommandSource};
use crate::config::{BlockDefaults, MAX_DURATION};
use crate::timer::{ScheduledTask, TimerToken, Wakeup};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// A new block is active until the given instant
    Blocked { until: Instant },
    /// The active block was pushed out to the given instant
    Extended { until: Instant },
    /// The active block was kept, the request had no effect
    Kept,
    /// The request resolved to a deadline that is not in the future
    Cleared,
}

/// Per-device block state machine
#[derive(Debug)]
pub struct BlockAutomaticHandler {
    defaults: BlockDefaults,
    blocked_until: Option<Instant>,
    revert_on_lift: bool,
    /// Command that installed the active block
    origin: Option<Arc<Command>>,
    restore_timer: ScheduledTask,
}

impl BlockAutomaticHandler {
    /// Create an unblocked handler. `wakeup` is called when the restore timer
    /// fires; the owner must pass the token back to [`Self::expire`].
    pub fn new(defaults: BlockDefaults, wakeup: Wakeup) -> Self {
        Self {
            defaults,
            blocked_until: None,
            revert_on_lift: defaults.revert_on_lift,
            origin: None,
            restore_timer: ScheduledTask::new("block restore", wakeup),
        }
    }

    #[must_use] pub fn defaults(&self) -> &BlockDefaults {
        &self.defaults
    }

    /// True while the current time is before the block deadline
    #[must_use] pub fn automatic_block_active(&self) -> bool {
        self.blocked_until.is_some_and(|until| Instant::now() < until)
    }

    /// Deadline of the active block
    #[must_use] pub fn blocked_until_instant(&self) -> Option<Instant> {
        self.blocked_until.filter(|until| Instant::now() < *until)
    }

    /// Wall-clock deadline of the active block, for UI and API surfaces
    #[must_use] pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        let remaining = self.blocked_until_instant()?.saturating_duration_since(Instant::now());
        let remaining = chrono::Duration::from_std(remaining).ok()?;
        Utc::now().checked_add_signed(remaining)
    }

    #[must_use] pub fn revert_on_lift(&self) -> bool {
        self.revert_on_lift
    }

    /// Apply a BlockAutomatic, BlockAutomaticUntil or LiftBlock command.
    ///
    /// Returns the restore command to dispatch, if any. Other kinds are ignored.
    pub fn apply(&mut self, command: &Arc<Command>) -> Option<Arc<Command>> {
        match command.payload() {
            CommandPayload::BlockAutomatic(request) => {
                self.disable_automatic(command, request.duration, request.policy, request.revert_on_lift);
                None
            }
            CommandPayload::BlockAutomaticUntil {
                until,
                policy,
                revert_on_lift,
            } => {
                self.disable_automatic_until(command, *until, *policy, *revert_on_lift);
                None
            }
            CommandPayload::LiftBlock { revert_on_lift } => {
                self.lift_automatic_block(command, *revert_on_lift)
            }
            _ => None,
        }
    }

    /// Block automatic control for `duration` (or the default duration)
    pub fn disable_automatic(
        &mut self,
        origin: &Arc<Command>,
        duration: Option<Duration>,
        policy: Option<CollisionPolicy>,
        revert_on_lift: Option<bool>,
    ) -> BlockOutcome {
        let duration = duration.unwrap_or_else(|| self.defaults.duration()).min(MAX_DURATION);
        let policy = policy.unwrap_or(self.defaults.collision_policy);
        let revert = revert_on_lift.unwrap_or(self.defaults.revert_on_lift);
        let now = Instant::now();
        let candidate = now + duration;

        let Some(current) = self.blocked_until_instant() else {
            if duration.is_zero() {
                self.clear();
                tracing::debug!(target: "automation::block", "Zero-length block requested, staying unblocked");
                return BlockOutcome::Cleared;
            }
            self.install(origin, candidate, duration, revert);
            return BlockOutcome::Blocked { until: candidate };
        };

        match policy.resolve(current, candidate, duration) {
            Resolution::Keep => {
                tracing::debug!(
                    target: "automation::block",
                    "Block request ({:?}, {}) kept active block with {:?} remaining",
                    duration,
                    policy,
                    current.saturating_duration_since(now)
                );
                BlockOutcome::Kept
            }
            Resolution::Replace(until) if until <= now => {
                self.clear();
                tracing::debug!(target: "automation::block", "Block replaced by zero-length block, unblocked");
                BlockOutcome::Cleared
            }
            Resolution::Replace(until) => {
                self.install(origin, until, until.saturating_duration_since(now), revert);
                BlockOutcome::Blocked { until }
            }
            Resolution::Extend(until) => {
                let until = until.min(now + MAX_DURATION);
                self.revert_on_lift |= revert;
                self.blocked_until = Some(until);
                self.restore_timer.arm(until.saturating_duration_since(now));
                tracing::debug!(
                    target: "automation::block",
                    "Extended automatic block by {:?}",
                    duration
                );
                BlockOutcome::Extended { until }
            }
        }
    }

    /// Block automatic control until an absolute date. Past dates block for zero time.
    pub fn disable_automatic_until(
        &mut self,
        origin: &Arc<Command>,
        target: DateTime<Utc>,
        policy: Option<CollisionPolicy>,
        revert_on_lift: Option<bool>,
    ) -> BlockOutcome {
        let duration = match (target - Utc::now()).to_std() {
            Ok(duration) => duration,
            Err(_) => {
                tracing::warn!(
                    target: "automation::block",
                    "Block target {} lies in the past, treating as zero-length block",
                    target
                );
                Duration::ZERO
            }
        };
        self.disable_automatic(origin, Some(duration), policy, revert_on_lift)
    }

    /// Lift the block now. Returns the restore command when reverting.
    pub fn lift_automatic_block(
        &mut self,
        origin: &Arc<Command>,
        revert_on_lift: Option<bool>,
    ) -> Option<Arc<Command>> {
        let inherited = if self.automatic_block_active() {
            self.revert_on_lift
        } else {
            self.defaults.revert_on_lift
        };
        let revert = revert_on_lift.unwrap_or(inherited);
        self.clear();

        tracing::info!(target: "automation::block", "Automatic block lifted (revert: {})", revert);
        revert.then(|| {
            Arc::new(
                Command::restore_automatic_value(origin, "automatic block lifted")
                    .with_override(CommandSource::Automatic),
            )
        })
    }

    /// Handle a restore timer wake-up. Stale tokens are ignored.
    pub fn expire(&mut self, token: TimerToken) -> Option<Arc<Command>> {
        if !self.restore_timer.complete(token) {
            return None;
        }
        let revert = self.revert_on_lift;
        let origin = self.origin.take();
        self.blocked_until = None;
        self.revert_on_lift = self.defaults.revert_on_lift;

        tracing::info!(target: "automation::block", "Automatic block expired (revert: {})", revert);
        if !revert {
            return None;
        }
        let restore = match origin {
            Some(origin) => Command::restore_automatic_value(&origin, "automatic block expired"),
            None => Command::restore_automatic_value(CommandSource::Automatic, "automatic block expired"),
        };
        Some(Arc::new(restore.with_override(CommandSource::Automatic)))
    }

    fn install(&mut self, origin: &Arc<Command>, until: Instant, duration: Duration, revert: bool) {
        self.blocked_until = Some(until);
        self.revert_on_lift = revert;
        self.origin = Some(Arc::clone(origin));
        self.restore_timer.arm(duration);
        tracing::info!(
            target: "automation::block",
            "Automatic control blocked for {:?} (revert: {}) by {}",
            duration,
            revert,
            origin.trace()
        );
    }

    fn clear(&mut self) {
        self.restore_timer.cancel();
        self.blocked_until = None;
        self.origin = None;
        self.revert_on_lift = self.defaults.revert_on_lift;
    }
}
