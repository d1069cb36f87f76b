//! Trace line format and post-record normalization
//!
//! Every event is stored as one space-separated line:
//!
//! ```text
//! K <timestamp_us> <device_num> <type_val> <code_val> <value>
//! P <timestamp_us> <platform_event_type> <response_time_us> <private> <second_private>
//! ```

use thiserror::Error;

use super::{Event, EventPayload, InputEvent, PlatformEvent, PlatformEventType};

/// Line prefix for kernel input events
pub const INPUT_MAGIC: &str = "K";

/// Line prefix for platform events
pub const PLATFORM_MAGIC: &str = "P";

const FIELD_COUNT: usize = 6;

/// A trace line with a known prefix that could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceLineError {
    #[error("expected 6 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid number in field {index}: {value:?}")]
    InvalidNumber { index: usize, value: String },

    #[error("unknown platform event type {0}")]
    UnknownPlatformEventType(i32),
}

impl Event {
    /// Serialize as a single trace line (without the trailing newline)
    pub fn to_trace_line(&self) -> String {
        match &self.payload {
            EventPayload::Input(input) => format!(
                "{} {} {} {} {} {}",
                INPUT_MAGIC,
                self.timestamp_us,
                input.device_num,
                input.type_val,
                input.code_val,
                input.value
            ),
            EventPayload::Platform(platform) => format!(
                "{} {} {} {} {} {}",
                PLATFORM_MAGIC,
                self.timestamp_us,
                platform.event_type.code(),
                platform.response_time_us,
                platform.private,
                platform.second_private
            ),
        }
    }

    /// Parse a trace line.
    ///
    /// Returns `Ok(None)` for blank lines and lines with an unknown prefix.
    pub fn parse_trace_line(line: &str) -> Result<Option<Event>, TraceLineError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&magic) = tokens.first() else {
            return Ok(None);
        };
        if magic != INPUT_MAGIC && magic != PLATFORM_MAGIC {
            return Ok(None);
        }
        if tokens.len() != FIELD_COUNT {
            return Err(TraceLineError::FieldCount(tokens.len()));
        }

        let timestamp_us: i64 = parse_field(&tokens, 1)?;
        let a: i32 = parse_field(&tokens, 2)?;
        let b: i32 = parse_field(&tokens, 3)?;
        let c: i32 = parse_field(&tokens, 4)?;
        let d: i32 = parse_field(&tokens, 5)?;

        let payload = if magic == INPUT_MAGIC {
            EventPayload::Input(InputEvent {
                device_num: a,
                type_val: b,
                code_val: c,
                value: d,
            })
        } else {
            let event_type =
                PlatformEventType::from_code(a).ok_or(TraceLineError::UnknownPlatformEventType(a))?;
            EventPayload::Platform(PlatformEvent {
                event_type,
                response_time_us: b,
                private: c,
                second_private: d,
            })
        };

        Ok(Some(Event {
            timestamp_us,
            payload,
        }))
    }
}

impl PlatformEvent {
    /// Row of the response event trace section
    pub fn to_response_line(&self, timestamp_us: i64) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            timestamp_us, self.event_type, self.private, self.second_private, self.response_time_us
        )
    }
}

fn parse_field<T: std::str::FromStr>(tokens: &[&str], index: usize) -> Result<T, TraceLineError> {
    tokens[index]
        .parse()
        .map_err(|_| TraceLineError::InvalidNumber {
            index,
            value: tokens[index].to_string(),
        })
}

/// Stable sort by timestamp. Events with equal timestamps keep their input order.
pub fn sort_by_timestamp(events: &mut [Event]) {
    events.sort_by_key(|e| e.timestamp_us);
}

/// Rewrite absolute timestamps as deltas from the previous event.
///
/// The first event always becomes 0. Expects `events` already sorted.
pub fn delta_encode(events: &mut [Event]) {
    let Some(first) = events.first() else {
        return;
    };
    let mut prev = first.timestamp_us;
    for event in events.iter_mut() {
        let current = event.timestamp_us;
        event.timestamp_us = current - prev;
        prev = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_line_format() {
        let event = Event::input(1_500, 3, 1, 330, 1);
        assert_eq!(event.to_trace_line(), "K 1500 3 1 330 1");
        assert_eq!(Event::parse_trace_line("K 1500 3 1 330 1").unwrap(), Some(event));
    }

    #[test]
    fn test_platform_line_parses() {
        let event = Event::parse_trace_line("P 42 4 900 -12345 0").unwrap().unwrap();
        assert_eq!(event, Event::activity_launch(42, 900, -12345));
    }

    #[test]
    fn test_unknown_prefix_and_blank_are_ignored() {
        assert_eq!(Event::parse_trace_line("").unwrap(), None);
        assert_eq!(Event::parse_trace_line("   ").unwrap(), None);
        assert_eq!(Event::parse_trace_line("X 1 2 3 4 5").unwrap(), None);
    }

    #[test]
    fn test_malformed_lines_are_errors() {
        assert_eq!(
            Event::parse_trace_line("K 1 2 3"),
            Err(TraceLineError::FieldCount(4))
        );
        assert!(matches!(
            Event::parse_trace_line("K 1 2 x 4 5"),
            Err(TraceLineError::InvalidNumber { index: 3, .. })
        ));
        assert_eq!(
            Event::parse_trace_line("P 1 99 0 0 0"),
            Err(TraceLineError::UnknownPlatformEventType(99))
        );
    }

    #[test]
    fn test_sort_is_stable_for_equal_timestamps() {
        let mut events = vec![
            Event::input(20, 0, 1, 1, 0),
            Event::input(10, 0, 1, 1, 1),
            Event::input(20, 0, 1, 1, 2),
            Event::input(10, 0, 1, 1, 3),
        ];
        sort_by_timestamp(&mut events);

        let values: Vec<i32> = events
            .iter()
            .map(|e| match e.payload {
                EventPayload::Input(input) => input.value,
                EventPayload::Platform(_) => -1,
            })
            .collect();
        assert_eq!(values, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_delta_encode_starts_at_zero() {
        let mut events = vec![
            Event::input(1_000, 0, 1, 1, 0),
            Event::input(1_250, 0, 1, 1, 0),
            Event::input(1_250, 0, 1, 1, 0),
            Event::input(2_000, 0, 1, 1, 0),
        ];
        delta_encode(&mut events);
        let timestamps: Vec<i64> = events.iter().map(|e| e.timestamp_us).collect();
        assert_eq!(timestamps, vec![0, 250, 0, 750]);
    }

    #[test]
    fn test_response_line_uses_type_name() {
        let event = Event::web_page_load(77, 3_000);
        let platform = event.as_platform().unwrap();
        assert_eq!(platform.to_response_line(event.timestamp_us), "77\tWebPageLoad\t0\t0\t3000");
    }
}
