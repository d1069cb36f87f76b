//! Messages exchanged between the controller and the device-side service

pub mod codec;

use serde::{Deserialize, Serialize};

use crate::data::Event;

/// One element of a transport batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Recorded event (device to controller while recording, controller to
    /// device while filling the replay buffer)
    Event(Event),
    /// Controller to device
    Command(Command),
    /// Device to controller
    ServiceState(ServiceState),
}

/// Commands sent to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    RecordingOn,
    RecordingOff,
    ReplayingOn {
        min_preload_size: u32,
        max_sleep_ms: u32,
    },
    ReplayingOff,
    RequestState,
    /// Announces a chunk; `num_events` event messages follow in the same batch
    FillReplayBuffer {
        sn: i64,
        num_events: u32,
        has_more: bool,
    },
    SkipWaitingInReplay,
}

/// The device's authoritative service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Idle,
    Recording,
    PreparingToReplay,
    Replaying(ReplayProgress),
}

/// Replay position reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayProgress {
    /// Chunk the device needs next
    pub required_sn: i64,
    /// Chunk the device is currently replaying
    pub running_sn: i64,
    pub present_buffer_index: i32,
    pub present_buffer_size: i32,
}

/// Variant tag of [`ServiceState`], used to detect transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStateKind {
    Idle,
    Recording,
    PreparingToReplay,
    Replaying,
}

impl ServiceState {
    pub fn kind(&self) -> ServiceStateKind {
        match self {
            ServiceState::Idle => ServiceStateKind::Idle,
            ServiceState::Recording => ServiceStateKind::Recording,
            ServiceState::PreparingToReplay => ServiceStateKind::PreparingToReplay,
            ServiceState::Replaying(_) => ServiceStateKind::Replaying,
        }
    }
}

impl std::fmt::Display for ServiceStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStateKind::Idle => write!(f, "idle"),
            ServiceStateKind::Recording => write!(f, "recording"),
            ServiceStateKind::PreparingToReplay => write!(f, "preparing to replay"),
            ServiceStateKind::Replaying => write!(f, "replaying"),
        }
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<ServiceState> for Message {
    fn from(state: ServiceState) -> Self {
        Message::ServiceState(state)
    }
}
