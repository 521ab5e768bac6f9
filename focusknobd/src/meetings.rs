//! Meeting-end detection over the last calendar push.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::Deserialize;

const MIN_DURATION_MIN: i64 = 10;
/// How long after its end a meeting still gets a prompt.
const PROMPT_WINDOW_SECS: i64 = 600;

/// One entry of the `CALENDAR` payload's `events` array.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CalendarEvent {
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_min: i64,
    pub is_all_day: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueMeeting {
    pub title: String,
    pub duration_min: u64,
}

/// Remembers which meetings were already offered today.
///
/// Meetings are identified by title plus start and end time. Two distinct
/// meetings sharing all three are still prompted once.
#[derive(Debug, Default)]
pub struct MeetingTracker {
    day: Option<NaiveDate>,
    prompted: HashSet<(String, String, String)>,
}

impl MeetingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Meetings that ended within the last ten minutes and were not offered
    /// yet. Each one returned is marked as offered.
    pub fn due(&mut self, events: &[CalendarEvent], now: NaiveDateTime) -> Vec<DueMeeting> {
        let today = now.date();
        if self.day != Some(today) {
            self.prompted.clear();
            self.day = Some(today);
        }
        if matches!(today.weekday(), Weekday::Sat | Weekday::Sun) {
            return Vec::new();
        }

        let mut due = Vec::new();
        for event in events {
            if event.is_all_day || event.duration_min < MIN_DURATION_MIN {
                continue;
            }
            let Ok(end) = NaiveTime::parse_from_str(&event.end_time, "%H:%M") else {
                continue;
            };
            let since_end = (now - today.and_time(end)).num_seconds();
            if !(0..=PROMPT_WINDOW_SECS).contains(&since_end) {
                continue;
            }
            let key = (
                event.title.clone(),
                event.start_time.clone(),
                event.end_time.clone(),
            );
            if !self.prompted.insert(key) {
                continue;
            }
            due.push(DueMeeting {
                title: if event.title.is_empty() {
                    "Unknown".to_string()
                } else {
                    event.title.clone()
                },
                duration_min: event.duration_min as u64,
            });
        }
        due
    }
}
