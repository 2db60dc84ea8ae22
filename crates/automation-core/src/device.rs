//! On/off actuator device
//!
//! An [`ActuatorDevice`] owns its block state, its write state, a bounded
//! command history and its driver. Every state transition runs synchronously
//! under the device lock; timer wake-ups and state reports re-enter the same
//! dispatch path, so no two transitions on one device ever overlap.

use crate::actuator::{ActuatorDebouncer, WriteDecision};
use crate::block::BlockAutomaticHandler;
use crate::command::{
    BlockRequest, Command, CommandKind, CommandPayload, CommandRecord, CommandSource, Origin,
};
use crate::config::{ArbitrationConfig, BlockDefaults, MAX_HISTORY_CAPACITY};
use crate::error::AutomationError;
use crate::timer::{TimerToken, Wakeup};
use chrono::{DateTime, Utc};
use device_core::{ActuatorDriver, DeviceId, JsonStore, StateReport};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Per-device settings, loaded through the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorSettings {
    /// Overrides the process-wide block defaults for this device
    pub block: Option<BlockDefaults>,
    /// Re-write the persisted on/off state on startup
    pub restore_state_on_start: bool,
}

/// Snapshot written to the store after confirmations and block transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedActuatorState {
    pub on: Option<bool>,
    #[serde(default)]
    pub queued: Option<bool>,
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revert_on_lift: bool,
    #[serde(default)]
    pub last_command: Option<CommandRecord>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only device status for UI and API surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub on: Option<bool>,
    pub queued: Option<bool>,
    pub automatic_block_active: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub target_automatic_state: Option<bool>,
    pub turn_off_pending: bool,
}

struct ActuatorInner {
    id: DeviceId,
    block: BlockAutomaticHandler,
    writes: ActuatorDebouncer,
    driver: Arc<dyn ActuatorDriver>,
    /// Last value an automatic command asked for
    target_automatic: Option<bool>,
    history: VecDeque<Arc<Command>>,
    history_capacity: usize,
    manual_block_on_write: bool,
    persist_tx: Option<mpsc::UnboundedSender<PersistedActuatorState>>,
}

/// Handle to an on/off actuator. Cheap to clone.
#[derive(Clone)]
pub struct ActuatorDevice {
    inner: Arc<Mutex<ActuatorInner>>,
}

impl ActuatorDevice {
    /// Create a device with default settings and no persistence.
    /// Must be called inside a tokio runtime.
    pub fn new(id: DeviceId, driver: Arc<dyn ActuatorDriver>, config: &ArbitrationConfig) -> Self {
        Self::with_settings(id, driver, config, &ActuatorSettings::default(), None)
    }

    /// Create a device with explicit settings and an optional store
    pub fn with_settings(
        id: DeviceId,
        driver: Arc<dyn ActuatorDriver>,
        config: &ArbitrationConfig,
        settings: &ActuatorSettings,
        store: Option<JsonStore>,
    ) -> Self {
        let block_defaults = settings.block.unwrap_or(config.block);
        let history_capacity = config.history_capacity.clamp(1, MAX_HISTORY_CAPACITY);
        let persist_tx = store.map(|store| spawn_state_writer(id.clone(), store));

        let inner = Arc::new_cyclic(|weak: &Weak<Mutex<ActuatorInner>>| {
            let block_wakeup: Wakeup = {
                let weak = weak.clone();
                Arc::new(move |token: TimerToken| {
                    if let Some(inner) = weak.upgrade() {
                        ActuatorDevice { inner }.block_expired(token);
                    }
                })
            };
            let turn_off_wakeup: Wakeup = {
                let weak = weak.clone();
                Arc::new(move |token: TimerToken| {
                    if let Some(inner) = weak.upgrade() {
                        ActuatorDevice { inner }.turn_off_due(token);
                    }
                })
            };
            Mutex::new(ActuatorInner {
                id,
                block: BlockAutomaticHandler::new(block_defaults, block_wakeup),
                writes: ActuatorDebouncer::new(turn_off_wakeup),
                driver,
                target_automatic: None,
                history: VecDeque::new(),
                history_capacity,
                manual_block_on_write: config.manual_block_on_write,
                persist_tx,
            })
        });
        Self { inner }
    }

    /// Create a device from its persisted settings and state.
    ///
    /// If the settings ask for it, the persisted on/off value is written to
    /// the device again. An unexpired persisted block is then re-installed.
    pub async fn load(
        id: DeviceId,
        driver: Arc<dyn ActuatorDriver>,
        config: &ArbitrationConfig,
        store: JsonStore,
    ) -> Self {
        let settings: ActuatorSettings = store.load_settings(&id).await.unwrap_or_default();
        let persisted: Option<PersistedActuatorState> = store.load_state(&id).await;
        let device = Self::with_settings(id, driver, config, &settings, Some(store));

        let Some(persisted) = persisted else {
            return device;
        };
        if settings.restore_state_on_start {
            if let Some(on) = persisted.on {
                device.handle(Command::write_state_to_device(
                    CommandSource::Initial,
                    on,
                    "restore persisted state",
                ));
            }
        }
        // Initial writes are not forced, so this must precede the block
        if let Some(until) = persisted.blocked_until.filter(|until| *until > Utc::now()) {
            device.handle(Command::block_automatic_until(
                CommandSource::Initial,
                until,
                None,
                Some(persisted.revert_on_lift),
                "restore persisted block",
            ));
        }
        device
    }

    fn lock(&self) -> MutexGuard<'_, ActuatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use] pub fn id(&self) -> DeviceId {
        self.lock().id.clone()
    }

    /// Dispatch a command. Rejections are recorded on the command and logged.
    pub fn handle(&self, command: impl Into<Arc<Command>>) {
        let command = command.into();
        if let Err(e) = self.try_handle(command) {
            tracing::debug!(target: "automation::actuator", "{}", e);
        }
    }

    /// Dispatch a command, reporting kinds this device does not handle
    pub fn try_handle(&self, command: impl Into<Arc<Command>>) -> Result<(), AutomationError> {
        self.lock().dispatch(command.into())
    }

    /// Switch on or off, optionally turning off again after `timeout`.
    /// Returns the dispatched command; a rejection shows in its ignore reason.
    pub fn set_actuator(
        &self,
        source: impl Into<Origin>,
        on: bool,
        timeout: Option<Duration>,
        reason: impl Into<String>,
    ) -> Arc<Command> {
        let mut command = Command::set_actuator_state(source, on, reason);
        if let Some(timeout) = timeout {
            command = command.with_timeout(timeout);
        }
        self.dispatch_returning(command)
    }

    pub fn toggle(&self, source: impl Into<Origin>, reason: impl Into<String>) -> Arc<Command> {
        self.dispatch_returning(Command::toggle_actuator(source, reason))
    }

    pub fn write_state_to_device(
        &self,
        source: impl Into<Origin>,
        on: bool,
        reason: impl Into<String>,
    ) -> Arc<Command> {
        self.dispatch_returning(Command::write_state_to_device(source, on, reason))
    }

    pub fn block_automatic(
        &self,
        source: impl Into<Origin>,
        request: BlockRequest,
        reason: impl Into<String>,
    ) -> Arc<Command> {
        self.dispatch_returning(Command::block_automatic(source, request, reason))
    }

    pub fn lift_automatic_block(
        &self,
        source: impl Into<Origin>,
        revert_on_lift: Option<bool>,
        reason: impl Into<String>,
    ) -> Arc<Command> {
        self.dispatch_returning(Command::lift_block(source, revert_on_lift, reason))
    }

    fn dispatch_returning(&self, command: Command) -> Arc<Command> {
        let command = Arc::new(command);
        self.handle(Arc::clone(&command));
        command
    }

    /// Record a state echoed back by the device
    pub fn confirm_state(&self, on: bool) {
        let mut inner = self.lock();
        inner.writes.confirm(on);
        tracing::debug!(target: "automation::actuator", "{} confirmed on={}", inner.id, on);
        inner.persist();
    }

    /// Confirm state from driver reports addressed to this device.
    ///
    /// The listener stops when the channel closes or the device is dropped.
    pub fn attach(&self, mut reports: broadcast::Receiver<StateReport>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let id = self.id();

        tokio::spawn(async move {
            loop {
                match reports.recv().await {
                    Ok(report) => {
                        if report.device != id {
                            continue;
                        }
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        ActuatorDevice { inner }.confirm_state(report.on);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("State listener for {} lagged by {} reports", id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("State report channel closed for {}", id);
                        break;
                    }
                }
            }
        })
    }

    #[must_use] pub fn automatic_block_active(&self) -> bool {
        self.lock().block.automatic_block_active()
    }

    #[must_use] pub fn blocked_until(&self) -> Option<DateTime<Utc>> {
        self.lock().block.blocked_until()
    }

    #[must_use] pub fn confirmed_state(&self) -> Option<bool> {
        self.lock().writes.confirmed_state()
    }

    #[must_use] pub fn queued_value(&self) -> Option<bool> {
        self.lock().writes.queued_value()
    }

    #[must_use] pub fn target_automatic_state(&self) -> Option<bool> {
        self.lock().target_automatic
    }

    #[must_use] pub fn turn_off_pending(&self) -> bool {
        self.lock().writes.turn_off_pending()
    }

    #[must_use] pub fn status(&self) -> DeviceStatus {
        let inner = self.lock();
        DeviceStatus {
            id: inner.id.clone(),
            on: inner.writes.confirmed_state(),
            queued: inner.writes.queued_value(),
            automatic_block_active: inner.block.automatic_block_active(),
            blocked_until: inner.block.blocked_until(),
            target_automatic_state: inner.target_automatic,
            turn_off_pending: inner.writes.turn_off_pending(),
        }
    }

    /// Recent commands, oldest first
    #[must_use] pub fn recent_commands(&self) -> Vec<CommandRecord> {
        self.lock().history.iter().map(|c| c.record()).collect()
    }

    /// Write the current state to the store and wait for it
    pub async fn persist_now(&self, store: &JsonStore) -> Result<(), AutomationError> {
        let (id, snapshot) = {
            let inner = self.lock();
            (inner.id.clone(), inner.snapshot())
        };
        store.persist(&id, &snapshot).await?;
        Ok(())
    }

    fn block_expired(&self, token: TimerToken) {
        let mut inner = self.lock();
        let restore = inner.block.expire(token);
        inner.persist();
        if let Some(restore) = restore {
            inner.run(restore);
        }
    }

    fn turn_off_due(&self, token: TimerToken) {
        let mut inner = self.lock();
        if let Some(off) = inner.writes.turn_off_due(token) {
            tracing::info!(target: "automation::actuator", "{} turn-off timeout reached", inner.id);
            inner.run(off);
        }
    }
}

impl ActuatorInner {
    /// Dispatch a command and every follow-up command it produces
    fn dispatch(&mut self, command: Arc<Command>) -> Result<(), AutomationError> {
        let mut next = self.process(command)?;
        while let Some(command) = next {
            next = self.process(command)?;
        }
        Ok(())
    }

    /// Dispatch a command produced internally (timers, restores)
    fn run(&mut self, command: Arc<Command>) {
        if let Err(e) = self.dispatch(command) {
            tracing::warn!(target: "automation::actuator", "{}", e);
        }
    }

    fn process(&mut self, command: Arc<Command>) -> Result<Option<Arc<Command>>, AutomationError> {
        self.remember(&command);

        let follow_up = match command.payload() {
            CommandPayload::SetActuatorState { on, timeout } => {
                self.set_actuator(&command, *on, *timeout);
                None
            }
            CommandPayload::ToggleActuator { timeout } => {
                let on = self.writes.toggle_target();
                self.set_actuator(&command, on, *timeout);
                None
            }
            CommandPayload::WriteStateToDevice { on } => {
                self.set_actuator(&command, *on, None);
                None
            }
            CommandPayload::BlockAutomatic(_)
            | CommandPayload::BlockAutomaticUntil { .. }
            | CommandPayload::LiftBlock { .. } => {
                let restore = self.block.apply(&command);
                self.persist();
                restore
            }
            CommandPayload::RestoreAutomaticValue => self.restore_automatic_value(&command),
            CommandPayload::SetShutterLevel { .. } | CommandPayload::RoomSetAll { .. } => {
                command.ignore("unsupported");
                return Err(AutomationError::Unsupported {
                    device: self.id.clone(),
                    kind: command.kind().to_string(),
                });
            }
        };
        Ok(follow_up)
    }

    fn set_actuator(&mut self, command: &Arc<Command>, on: bool, timeout: Option<Duration>) {
        if command.is_automatic() {
            self.target_automatic = Some(on);
        }

        let decision = self.writes.submit(
            command,
            on,
            timeout,
            self.block.blocked_until_instant(),
            self.driver.as_ref(),
        );

        let explicit_block = command.contains_kind(CommandKind::BlockAutomatic)
            || command.contains_kind(CommandKind::BlockAutomaticUntil);
        if let WriteDecision::Write(_) = decision {
            if self.manual_block_on_write && command.is_manual() && !explicit_block {
                self.block.disable_automatic(command, None, None, None);
                self.persist();
            }
        }
    }

    fn restore_automatic_value(&mut self, command: &Arc<Command>) -> Option<Arc<Command>> {
        match self.target_automatic {
            Some(on) => Some(Arc::new(Command::set_actuator_state(
                command,
                on,
                "restore automatic value",
            ))),
            None => {
                command.ignore("no automatic value");
                tracing::debug!(
                    target: "automation::block",
                    "{} has no automatic value to restore",
                    self.id
                );
                None
            }
        }
    }

    fn remember(&mut self, command: &Arc<Command>) {
        tracing::debug!(target: "automation::actuator", "{} <- {}", self.id, command.trace());
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(Arc::clone(command));
    }

    fn snapshot(&self) -> PersistedActuatorState {
        PersistedActuatorState {
            on: self.writes.confirmed_state(),
            queued: self.writes.queued_value(),
            blocked_until: self.block.blocked_until(),
            revert_on_lift: self.block.revert_on_lift(),
            last_command: self.history.back().map(|c| c.record()),
            updated_at: Utc::now(),
        }
    }

    /// Hand a snapshot to the state writer, if the device has a store
    fn persist(&self) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(self.snapshot()).is_err() {
                tracing::warn!("State writer for {} is gone", self.id);
            }
        }
    }
}

/// Spawn the task that writes state snapshots in order
fn spawn_state_writer(id: DeviceId, store: JsonStore) -> mpsc::UnboundedSender<PersistedActuatorState> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistedActuatorState>();
    tokio::spawn(async move {
        while let Some(mut snapshot) = rx.recv().await {
            // Only the newest queued snapshot matters
            while let Ok(newer) = rx.try_recv() {
                snapshot = newer;
            }
            if let Err(e) = store.persist(&id, &snapshot).await {
                tracing::warn!("Failed to persist state of {}: {}", id, e);
            }
        }
        tracing::debug!("State writer for {} shutting down", id);
    });
    tx
}
