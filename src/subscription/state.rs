//! Subscription lifecycle as an explicit transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Created,
    Snapshotting,
    Streaming,
    Paused,
    Stopped,
    /// Needs an operator; the checkpoint is kept for diagnosis
    Failed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Created => "created",
            SubscriptionState::Snapshotting => "snapshotting",
            SubscriptionState::Streaming => "streaming",
            SubscriptionState::Paused => "paused",
            SubscriptionState::Stopped => "stopped",
            SubscriptionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Operator requests accepted by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Pause,
    Resume,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
        };
        f.write_str(name)
    }
}

/// Every input of the state machine, operator driven or internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start { snapshot: bool },
    SnapshotComplete,
    Pause,
    Resume,
    Stop,
    Fail,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Start { .. } => "start",
            Command::SnapshotComplete => "complete snapshot",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::Fail => "fail",
        };
        f.write_str(name)
    }
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Stopped | SubscriptionState::Failed)
    }

    /// Whether a capture and apply pipeline runs in this state.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Snapshotting | SubscriptionState::Streaming
        )
    }

    pub(crate) fn transition(self, command: Command) -> Result<SubscriptionState> {
        use SubscriptionState::*;

        let next = match (self, command) {
            (Created | Stopped | Failed, Command::Start { snapshot: true }) => Snapshotting,
            (Created | Stopped | Failed, Command::Start { snapshot: false }) => Streaming,
            (Snapshotting, Command::SnapshotComplete) => Streaming,
            (Streaming, Command::Pause) => Paused,
            (Paused, Command::Resume) => Streaming,
            (Stopped | Failed, Command::Stop) => self,
            (_, Command::Stop) => Stopped,
            (Stopped, Command::Fail) => {
                return Err(Error::InvalidTransition {
                    state: self.to_string(),
                    command: command.to_string(),
                })
            }
            (_, Command::Fail) => Failed,
            _ => {
                return Err(Error::InvalidTransition {
                    state: self.to_string(),
                    command: command.to_string(),
                })
            }
        };
        Ok(next)
    }
}
