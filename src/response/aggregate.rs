use std::fmt::Write as _;

use serde::Serialize;

use crate::data::{sort_by_timestamp, Event, PlatformEvent, PlatformEventType};

const NO_ACTIVITY: &str = "(none)";

/// Summed response time of one event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeTotal {
    pub event_type: PlatformEventType,
    pub total_response_time_us: i64,
}

/// Totals attributed to one activity.
/// `hashed_name` is `None` for events seen before the first launch and for
/// launches whose component hash is 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityTotals {
    pub hashed_name: Option<i32>,
    pub totals: Vec<TypeTotal>,
}

/// Response-time statistics of a replay, in first-seen order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseReport {
    pub global: Vec<TypeTotal>,
    pub activities: Vec<ActivityTotals>,
    /// Every platform event, sorted by timestamp
    pub trace: Vec<(i64, PlatformEvent)>,
}

impl ResponseReport {
    /// Aggregate the platform events among `events`; input events are ignored.
    ///
    /// An activity launch switches the current activity before its own
    /// response time is counted, so launches are attributed to the activity
    /// they launched.
    pub fn aggregate(events: impl IntoIterator<Item = Event>) -> Self {
        let mut events: Vec<Event> = events.into_iter().filter(|e| !e.is_input()).collect();
        sort_by_timestamp(&mut events);

        let mut global = Vec::new();
        let mut activities = vec![ActivityTotals {
            hashed_name: None,
            totals: Vec::new(),
        }];
        let mut current = 0;
        let mut trace = Vec::with_capacity(events.len());

        for event in &events {
            let Some(platform) = event.as_platform() else {
                continue;
            };

            if platform.event_type == PlatformEventType::ActivityLaunch {
                // Hash 0 is the default bucket
                let hashed = (platform.private != 0).then_some(platform.private);
                current = match activities.iter().position(|a| a.hashed_name == hashed) {
                    Some(index) => index,
                    None => {
                        activities.push(ActivityTotals {
                            hashed_name: hashed,
                            totals: Vec::new(),
                        });
                        activities.len() - 1
                    }
                };
            }

            let response = i64::from(platform.response_time_us);
            accumulate(&mut activities[current].totals, platform.event_type, response);
            accumulate(&mut global, platform.event_type, response);
            trace.push((event.timestamp_us, *platform));
        }

        Self {
            global,
            activities,
            trace,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    /// Three tab-separated sections: totals by type, totals by activity and
    /// type, then the chronological event trace.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("[Total Response Time]\n");
        out.push_str("Type\tResponse time(us)\n");
        for total in &self.global {
            let _ = writeln!(out, "{}\t{}", total.event_type, total.total_response_time_us);
        }

        out.push('\n');
        out.push_str("[Activity Response Time]\n");
        out.push_str("Hashed Name\tType\tResponse time(us)\n");
        for activity in &self.activities {
            let name = match activity.hashed_name {
                Some(hashed) => hashed.to_string(),
                None => NO_ACTIVITY.to_string(),
            };
            for total in &activity.totals {
                let _ = writeln!(
                    out,
                    "{}\t{}\t{}",
                    name, total.event_type, total.total_response_time_us
                );
            }
        }

        out.push('\n');
        out.push_str("[Response Event Trace]\n");
        out.push_str("Timestamp(US)\tType\tPrivate 1\tPrivate 2\tResponse time(us)\n");
        for (timestamp_us, platform) in &self.trace {
            out.push_str(&platform.to_response_line(*timestamp_us));
            out.push('\n');
        }

        out
    }
}

fn accumulate(totals: &mut Vec<TypeTotal>, event_type: PlatformEventType, response_time_us: i64) {
    match totals.iter_mut().find(|t| t.event_type == event_type) {
        Some(total) => total.total_response_time_us += response_time_us,
        None => totals.push(TypeTotal {
            event_type,
            total_response_time_us: response_time_us,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay_events() -> Vec<Event> {
        vec![
            Event::view_input(300, 40),
            Event::activity_launch(100, 900, 77),
            Event::view_input(50, 10),
            Event::input(60, 0, 1, 330, 1),
            Event::activity_launch(400, 700, -5),
            Event::web_page_load(500, 2_000),
            Event::activity_launch(600, 300, 77),
            Event::view_input(700, 60),
        ]
    }

    #[test]
    fn test_totals_by_type_and_activity() {
        let report = ResponseReport::aggregate(replay_events());

        assert_eq!(
            report.global,
            vec![
                TypeTotal {
                    event_type: PlatformEventType::ViewInput,
                    total_response_time_us: 110,
                },
                TypeTotal {
                    event_type: PlatformEventType::ActivityLaunch,
                    total_response_time_us: 1_900,
                },
                TypeTotal {
                    event_type: PlatformEventType::WebPageLoad,
                    total_response_time_us: 2_000,
                },
            ]
        );

        let names: Vec<Option<i32>> = report.activities.iter().map(|a| a.hashed_name).collect();
        assert_eq!(names, vec![None, Some(77), Some(-5)]);

        // Before any launch
        assert_eq!(report.activities[0].totals.len(), 1);
        assert_eq!(report.activities[0].totals[0].total_response_time_us, 10);

        // Both launches of 77 and the views that followed them
        let activity_77 = &report.activities[1].totals;
        assert_eq!(activity_77[0].event_type, PlatformEventType::ActivityLaunch);
        assert_eq!(activity_77[0].total_response_time_us, 1_200);
        assert_eq!(activity_77[1].event_type, PlatformEventType::ViewInput);
        assert_eq!(activity_77[1].total_response_time_us, 100);

        assert_eq!(report.trace.len(), 7);
        assert!(report.trace.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_rendered_sections() {
        let report = ResponseReport::aggregate(vec![
            Event::view_input(5, 10),
            Event::activity_launch(10, 900, 42),
            Event::view_input(20, 30),
        ]);

        let expected = "\
[Total Response Time]
Type\tResponse time(us)
ViewInput\t40
ActivityLaunch\t900

[Activity Response Time]
Hashed Name\tType\tResponse time(us)
(none)\tViewInput\t10
42\tActivityLaunch\t900
42\tViewInput\t30

[Response Event Trace]
Timestamp(US)\tType\tPrivate 1\tPrivate 2\tResponse time(us)
5\tViewInput\t0\t0\t10
10\tActivityLaunch\t42\t0\t900
20\tViewInput\t0\t0\t30
";
        assert_eq!(report.render(), expected);
    }

    #[test]
    fn test_zero_hash_launch_uses_default_bucket() {
        let report = ResponseReport::aggregate(vec![
            Event::view_input(5, 10),
            Event::activity_launch(10, 900, 42),
            Event::activity_launch(20, 400, 0),
            Event::view_input(30, 20),
        ]);

        let names: Vec<Option<i32>> = report.activities.iter().map(|a| a.hashed_name).collect();
        assert_eq!(names, vec![None, Some(42)]);

        let default = &report.activities[0].totals;
        assert_eq!(default.len(), 2);
        assert_eq!(default[0].event_type, PlatformEventType::ViewInput);
        assert_eq!(default[0].total_response_time_us, 30);
        assert_eq!(default[1].event_type, PlatformEventType::ActivityLaunch);
        assert_eq!(default[1].total_response_time_us, 400);
        assert!(report.render().contains("(none)\tActivityLaunch\t400\n"));
    }

    #[test]
    fn test_no_platform_events() {
        let report = ResponseReport::aggregate(vec![Event::input(1, 0, 1, 1, 1)]);
        assert!(report.is_empty());
        assert!(report.global.is_empty());
        assert_eq!(report.activities.len(), 1);
    }
}
