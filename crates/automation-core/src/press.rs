//! Short/long press detection for physical buttons
//!
//! Buttons do not always report their release. Every channel that goes to
//! `true` arms a self-reset timer that forces it back to `false` through the
//! regular update path, so a press can never stay stuck.

use crate::config::PressTimings;
use crate::timer::{ScheduledTask, TimerToken, Wakeup};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Press channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PressChannel {
    Short,
    Long,
}

/// Callback fired with the new value of a channel
pub type PressCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct ChannelState {
    pressed: bool,
    reset_after: Duration,
    reset: ScheduledTask,
    callbacks: Vec<PressCallback>,
}

impl ChannelState {
    fn new(reset_after: Duration, wakeup: Wakeup, label: &'static str) -> Self {
        Self {
            pressed: false,
            reset_after,
            reset: ScheduledTask::new(label, wakeup),
            callbacks: Vec::new(),
        }
    }
}

struct PressInner {
    short: ChannelState,
    long: ChannelState,
}

impl PressInner {
    fn channel(&mut self, channel: PressChannel) -> &mut ChannelState {
        match channel {
            PressChannel::Short => &mut self.short,
            PressChannel::Long => &mut self.long,
        }
    }
}

/// Debounced short/long press state of one button
#[derive(Clone)]
pub struct PressDebouncer {
    inner: Arc<Mutex<PressInner>>,
}

impl PressDebouncer {
    /// Create a released button. Must be used inside a tokio runtime.
    #[must_use] pub fn new(timings: PressTimings) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Mutex<PressInner>>| {
            let wakeup = |channel: PressChannel| -> Wakeup {
                let weak = weak.clone();
                Arc::new(move |token: TimerToken| {
                    if let Some(inner) = weak.upgrade() {
                        PressDebouncer { inner }.reset_due(channel, token);
                    }
                })
            };
            Mutex::new(PressInner {
                short: ChannelState::new(
                    Duration::from_millis(timings.short_reset_ms),
                    wakeup(PressChannel::Short),
                    "short press reset",
                ),
                long: ChannelState::new(
                    Duration::from_millis(timings.long_reset_ms),
                    wakeup(PressChannel::Long),
                    "long press reset",
                ),
            })
        });
        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, PressInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for changes of a channel
    pub fn on_change(&self, channel: PressChannel, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.lock().channel(channel).callbacks.push(Arc::new(callback));
    }

    #[must_use] pub fn is_pressed(&self, channel: PressChannel) -> bool {
        self.lock().channel(channel).pressed
    }

    /// Set a channel. No-op when the value is unchanged.
    pub fn update(&self, channel: PressChannel, value: bool) {
        let callbacks = {
            let mut inner = self.lock();
            let state = inner.channel(channel);
            if state.pressed == value {
                return;
            }
            state.pressed = value;
            if value {
                let reset_after = state.reset_after;
                state.reset.arm(reset_after);
            } else {
                state.reset.cancel();
            }
            state.callbacks.clone()
        };

        tracing::debug!(target: "automation::press", "{:?} press -> {}", channel, value);
        // Callbacks run without the lock so they may update the button again
        for callback in callbacks {
            callback(value);
        }
    }

    fn reset_due(&self, channel: PressChannel, token: TimerToken) {
        let accepted = self.lock().channel(channel).reset.complete(token);
        if accepted {
            tracing::debug!(target: "automation::press", "{:?} press auto-reset", channel);
            self.update(channel, false);
        }
    }
}
