//! Recorded event data structures

use serde::{Deserialize, Serialize};

/// A single timestamped event captured on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Timestamp in microseconds. Absolute while recording, a delta from the
    /// previous event once the trace file has been normalized.
    pub timestamp_us: i64,

    /// What happened
    pub payload: EventPayload,
}

/// Kind of recorded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    /// Raw kernel input event (evdev style)
    Input(InputEvent),

    /// Framework-level event carrying response-time telemetry
    Platform(PlatformEvent),
}

/// Kernel input event fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Index of the input device node
    pub device_num: i32,

    /// evdev event type (EV_KEY, EV_ABS, ...)
    pub type_val: i32,

    /// evdev event code
    pub code_val: i32,

    /// Event value
    pub value: i32,
}

/// Platform event fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub event_type: PlatformEventType,

    /// Measured response time in microseconds
    pub response_time_us: i32,

    /// Type-specific value. For activity launches this is the hashed
    /// component name of the launched activity.
    pub private: i32,

    /// Second type-specific value
    pub second_private: i32,
}

/// Platform event type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformEventType {
    ViewInput,
    WebPageLoad,
    ActivityPause,
    ActivityLaunch,
    ViewShortClick,
    ViewLongClick,
}

impl PlatformEventType {
    /// Numeric code used in trace lines
    pub fn code(self) -> i32 {
        match self {
            PlatformEventType::ViewInput => 1,
            PlatformEventType::WebPageLoad => 2,
            PlatformEventType::ActivityPause => 3,
            PlatformEventType::ActivityLaunch => 4,
            PlatformEventType::ViewShortClick => 5,
            PlatformEventType::ViewLongClick => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(PlatformEventType::ViewInput),
            2 => Some(PlatformEventType::WebPageLoad),
            3 => Some(PlatformEventType::ActivityPause),
            4 => Some(PlatformEventType::ActivityLaunch),
            5 => Some(PlatformEventType::ViewShortClick),
            6 => Some(PlatformEventType::ViewLongClick),
            _ => None,
        }
    }

    /// Display name used in response reports
    pub fn name(self) -> &'static str {
        match self {
            PlatformEventType::ViewInput => "ViewInput",
            PlatformEventType::WebPageLoad => "WebPageLoad",
            PlatformEventType::ActivityPause => "ActivityPause",
            PlatformEventType::ActivityLaunch => "ActivityLaunch",
            PlatformEventType::ViewShortClick => "ViewShortClick",
            PlatformEventType::ViewLongClick => "ViewLongClick",
        }
    }
}

impl std::fmt::Display for PlatformEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Event {
    /// Create a kernel input event
    pub fn input(timestamp_us: i64, device_num: i32, type_val: i32, code_val: i32, value: i32) -> Self {
        Self {
            timestamp_us,
            payload: EventPayload::Input(InputEvent {
                device_num,
                type_val,
                code_val,
                value,
            }),
        }
    }

    /// Create a platform event
    pub fn platform(
        timestamp_us: i64,
        event_type: PlatformEventType,
        response_time_us: i32,
        private: i32,
        second_private: i32,
    ) -> Self {
        Self {
            timestamp_us,
            payload: EventPayload::Platform(PlatformEvent {
                event_type,
                response_time_us,
                private,
                second_private,
            }),
        }
    }

    pub fn view_input(timestamp_us: i64, response_time_us: i32) -> Self {
        Self::platform(timestamp_us, PlatformEventType::ViewInput, response_time_us, 0, 0)
    }

    pub fn web_page_load(timestamp_us: i64, response_time_us: i32) -> Self {
        Self::platform(timestamp_us, PlatformEventType::WebPageLoad, response_time_us, 0, 0)
    }

    pub fn activity_launch(timestamp_us: i64, response_time_us: i32, hashed_component_name: i32) -> Self {
        Self::platform(
            timestamp_us,
            PlatformEventType::ActivityLaunch,
            response_time_us,
            hashed_component_name,
            0,
        )
    }

    /// Whether this is a kernel input event
    pub fn is_input(&self) -> bool {
        matches!(self.payload, EventPayload::Input(_))
    }

    /// Platform fields, if this is a platform event
    pub fn as_platform(&self) -> Option<&PlatformEvent> {
        match &self.payload {
            EventPayload::Platform(platform) => Some(platform),
            EventPayload::Input(_) => None,
        }
    }
}
