//! Command model
//!
//! Every state change requested anywhere in the system is a [`Command`]. A
//! command is created from either a primitive [`CommandSource`] or from the
//! command that caused it, which forms a causality chain. Classification
//! (automatic, force, manual, initial) is derived by walking that chain.

use crate::collision::CollisionPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

/// Primitive origin of a command chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Unknown,
    Initial,
    Automatic,
    ApiAutomatic,
    Manual,
    Api,
    Force,
}

impl CommandSource {
    /// Issued by rule-based logic
    #[must_use] pub fn is_automatic(self) -> bool {
        matches!(self, Self::Automatic | Self::ApiAutomatic)
    }

    /// Takes precedence over automatic control
    #[must_use] pub fn is_force(self) -> bool {
        matches!(self, Self::Force | Self::Manual | Self::Api)
    }

    /// Issued by a user or an API caller
    #[must_use] pub fn is_manual(self) -> bool {
        matches!(self, Self::Manual | Self::Api)
    }

    #[must_use] pub fn is_initial(self) -> bool {
        matches!(self, Self::Initial)
    }

    #[must_use] pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Initial => "Initial",
            Self::Automatic => "Automatic",
            Self::ApiAutomatic => "ApiAutomatic",
            Self::Manual => "Manual",
            Self::Api => "Api",
            Self::Force => "Force",
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command comes from: a primitive tag or a parent command
#[derive(Debug, Clone)]
pub enum Origin {
    Source(CommandSource),
    Command(Arc<Command>),
}

impl From<CommandSource> for Origin {
    fn from(source: CommandSource) -> Self {
        Self::Source(source)
    }
}

impl From<Arc<Command>> for Origin {
    fn from(command: Arc<Command>) -> Self {
        Self::Command(command)
    }
}

impl From<&Arc<Command>> for Origin {
    fn from(command: &Arc<Command>) -> Self {
        Self::Command(Arc::clone(command))
    }
}

/// Command variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SetActuatorState,
    ToggleActuator,
    WriteStateToDevice,
    BlockAutomatic,
    BlockAutomaticUntil,
    LiftBlock,
    RestoreAutomaticValue,
    SetShutterLevel,
    RoomSetAll,
}

impl CommandKind {
    #[must_use] pub fn as_str(self) -> &'static str {
        match self {
            Self::SetActuatorState => "SetActuatorState",
            Self::ToggleActuator => "ToggleActuator",
            Self::WriteStateToDevice => "WriteStateToDevice",
            Self::BlockAutomatic => "BlockAutomatic",
            Self::BlockAutomaticUntil => "BlockAutomaticUntil",
            Self::LiftBlock => "LiftBlock",
            Self::RestoreAutomaticValue => "RestoreAutomaticValue",
            Self::SetShutterLevel => "SetShutterLevel",
            Self::RoomSetAll => "RoomSetAll",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block request carried by a BlockAutomatic command.
///
/// Unset fields fall back to the block defaults of the receiving device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRequest {
    pub duration: Option<Duration>,
    pub policy: Option<CollisionPolicy>,
    pub revert_on_lift: Option<bool>,
}

/// Per-kind payload
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    SetActuatorState {
        on: bool,
        /// Turn the actuator off again after this long (only when switching on)
        timeout: Option<Duration>,
    },
    ToggleActuator {
        timeout: Option<Duration>,
    },
    WriteStateToDevice {
        on: bool,
    },
    BlockAutomatic(BlockRequest),
    BlockAutomaticUntil {
        until: DateTime<Utc>,
        policy: Option<CollisionPolicy>,
        revert_on_lift: Option<bool>,
    },
    LiftBlock {
        revert_on_lift: Option<bool>,
    },
    RestoreAutomaticValue,
    SetShutterLevel {
        level: u8,
    },
    RoomSetAll {
        on: bool,
    },
}

impl CommandPayload {
    #[must_use] pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetActuatorState { .. } => CommandKind::SetActuatorState,
            Self::ToggleActuator { .. } => CommandKind::ToggleActuator,
            Self::WriteStateToDevice { .. } => CommandKind::WriteStateToDevice,
            Self::BlockAutomatic(_) => CommandKind::BlockAutomatic,
            Self::BlockAutomaticUntil { .. } => CommandKind::BlockAutomaticUntil,
            Self::LiftBlock { .. } => CommandKind::LiftBlock,
            Self::RestoreAutomaticValue => CommandKind::RestoreAutomaticValue,
            Self::SetShutterLevel { .. } => CommandKind::SetShutterLevel,
            Self::RoomSetAll { .. } => CommandKind::RoomSetAll,
        }
    }
}

/// One requested state transition
pub struct Command {
    id: Uuid,
    timestamp: DateTime<Utc>,
    source: Origin,
    override_source: Option<CommandSource>,
    reason: String,
    ignore_reason: OnceLock<String>,
    payload: CommandPayload,
}

impl Command {
    /// Create a command from an origin, a reason and a payload
    pub fn new(source: impl Into<Origin>, reason: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            override_source: None,
            reason: reason.into(),
            ignore_reason: OnceLock::new(),
            payload,
        }
    }

    pub fn set_actuator_state(source: impl Into<Origin>, on: bool, reason: impl Into<String>) -> Self {
        Self::new(source, reason, CommandPayload::SetActuatorState { on, timeout: None })
    }

    pub fn toggle_actuator(source: impl Into<Origin>, reason: impl Into<String>) -> Self {
        Self::new(source, reason, CommandPayload::ToggleActuator { timeout: None })
    }

    pub fn write_state_to_device(source: impl Into<Origin>, on: bool, reason: impl Into<String>) -> Self {
        Self::new(source, reason, CommandPayload::WriteStateToDevice { on })
    }

    pub fn block_automatic(
        source: impl Into<Origin>,
        request: BlockRequest,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(source, reason, CommandPayload::BlockAutomatic(request))
    }

    pub fn block_automatic_until(
        source: impl Into<Origin>,
        until: DateTime<Utc>,
        policy: Option<CollisionPolicy>,
        revert_on_lift: Option<bool>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            source,
            reason,
            CommandPayload::BlockAutomaticUntil {
                until,
                policy,
                revert_on_lift,
            },
        )
    }

    pub fn lift_block(
        source: impl Into<Origin>,
        revert_on_lift: Option<bool>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(source, reason, CommandPayload::LiftBlock { revert_on_lift })
    }

    pub fn restore_automatic_value(source: impl Into<Origin>, reason: impl Into<String>) -> Self {
        Self::new(source, reason, CommandPayload::RestoreAutomaticValue)
    }

    pub fn set_shutter_level(source: impl Into<Origin>, level: u8, reason: impl Into<String>) -> Self {
        Self::new(source, reason, CommandPayload::SetShutterLevel { level: level.min(100) })
    }

    pub fn room_set_all(source: impl Into<Origin>, on: bool, reason: impl Into<String>) -> Self {
        Self::new(source, reason, CommandPayload::RoomSetAll { on })
    }

    /// Decide the provenance of this link regardless of its ancestors
    #[must_use] pub fn with_override(mut self, source: CommandSource) -> Self {
        self.override_source = Some(source);
        self
    }

    /// Attach a turn-off timeout to a SetActuatorState or ToggleActuator command
    #[must_use] pub fn with_timeout(mut self, timeout: Duration) -> Self {
        match &mut self.payload {
            CommandPayload::SetActuatorState { timeout: t, .. }
            | CommandPayload::ToggleActuator { timeout: t } => *t = Some(timeout),
            other => tracing::warn!("Timeout ignored on {} command", other.kind()),
        }
        self
    }

    #[must_use] pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use] pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use] pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    #[must_use] pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    #[must_use] pub fn source(&self) -> &Origin {
        &self.source
    }

    #[must_use] pub fn override_source(&self) -> Option<CommandSource> {
        self.override_source
    }

    #[must_use] pub fn reason(&self) -> &str {
        &self.reason
    }

    #[must_use] pub fn parent(&self) -> Option<&Arc<Command>> {
        match &self.source {
            Origin::Command(parent) => Some(parent),
            Origin::Source(_) => None,
        }
    }

    /// Walk from this command to the root of its chain
    #[must_use] pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self) }
    }

    /// Source deciding the classification: the nearest override, else the root tag
    #[must_use] pub fn effective_source(&self) -> CommandSource {
        for link in self.chain() {
            if let Some(source) = link.override_source {
                return source;
            }
            if let Origin::Source(source) = link.source {
                return source;
            }
        }
        // The last link of a chain always carries a primitive source
        CommandSource::Unknown
    }

    #[must_use] pub fn is_automatic(&self) -> bool {
        self.effective_source().is_automatic()
    }

    #[must_use] pub fn is_force(&self) -> bool {
        self.effective_source().is_force()
    }

    #[must_use] pub fn is_manual(&self) -> bool {
        self.effective_source().is_manual()
    }

    #[must_use] pub fn is_initial(&self) -> bool {
        self.effective_source().is_initial()
    }

    /// Whether this command or any ancestor has the given kind
    #[must_use] pub fn contains_kind(&self, kind: CommandKind) -> bool {
        self.chain().any(|link| link.kind() == kind)
    }

    /// Record why this command was rejected. The first reason wins.
    pub fn ignore(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Err(reason) = self.ignore_reason.set(reason) {
            tracing::debug!(
                "Command {} already ignored, dropping extra reason '{}'",
                self.id,
                reason
            );
        }
    }

    #[must_use] pub fn ignore_reason(&self) -> Option<&str> {
        self.ignore_reason.get().map(String::as_str)
    }

    /// Human readable provenance, root first. Diagnostics only.
    #[must_use] pub fn trace(&self) -> String {
        let links: Vec<&Command> = self.chain().collect();
        let mut segments = Vec::with_capacity(links.len() + 1);

        if let Some(Origin::Source(root)) = links.last().map(|c| &c.source) {
            segments.push(root.to_string());
        }
        for link in links.iter().rev() {
            let mut segment = format!("{}(\"{}\")", link.kind(), link.reason);
            if let Some(source) = link.override_source {
                segment.push_str(&format!(" as {source}"));
            }
            if let Some(ignored) = link.ignore_reason() {
                segment.push_str(&format!(" [ignored: {ignored}]"));
            }
            segments.push(segment);
        }
        segments.join(" -> ")
    }

    /// Serializable snapshot for history and persistence
    #[must_use] pub fn record(&self) -> CommandRecord {
        CommandRecord {
            id: self.id,
            kind: self.kind(),
            timestamp: self.timestamp,
            source: self.effective_source(),
            reason: self.reason.clone(),
            ignore_reason: self.ignore_reason().map(str::to_string),
            trace: self.trace(),
        }
    }
}

// Only the parent's id is printed, so deep chains format in constant stack
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Command");
        s.field("id", &self.id).field("kind", &self.kind());
        match &self.source {
            Origin::Source(source) => s.field("source", source),
            Origin::Command(parent) => s.field("parent", &parent.id),
        };
        s.field("override_source", &self.override_source)
            .field("reason", &self.reason)
            .field("ignore_reason", &self.ignore_reason.get())
            .finish_non_exhaustive()
    }
}

impl Drop for Command {
    // Unlink the chain iteratively so dropping a deep chain does not recurse
    fn drop(&mut self) {
        let mut next = std::mem::replace(&mut self.source, Origin::Source(CommandSource::Unknown));
        while let Origin::Command(parent) = next {
            match Arc::try_unwrap(parent) {
                Ok(mut parent) => {
                    next = std::mem::replace(
                        &mut parent.source,
                        Origin::Source(CommandSource::Unknown),
                    );
                }
                Err(_) => break,
            }
        }
    }
}

/// Iterator over a command chain, from a command to its root
pub struct Chain<'a> {
    next: Option<&'a Command>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Command;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent().map(Arc::as_ref);
        Some(current)
    }
}

/// Serializable snapshot of a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: Uuid,
    pub kind: CommandKind,
    pub timestamp: DateTime<Utc>,
    pub source: CommandSource,
    pub reason: String,
    #[serde(default)]
    pub ignore_reason: Option<String>,
    pub trace: String,
}
