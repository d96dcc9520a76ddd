//! Playlist resolution.
//!
//! Given a device's assignments and an instant, pick the playlist that should
//! be playing. Everything here is pure: no clock reads, no I/O, so the same
//! inputs always produce the same answer.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// When a playlist may play. Every field is optional; an empty config is
/// always eligible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default, with = "time_of_day")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, with = "time_of_day")]
    pub end_time: Option<NaiveTime>,
    pub timezone: Option<Tz>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    /// ISO weekdays, 1 = Monday .. 7 = Sunday. Empty means the start date's weekday.
    Weekly {
        #[serde(default)]
        days_of_week: BTreeSet<u8>,
    },
    /// Defaults to the start date's day. Months without that day are skipped.
    Monthly {
        #[serde(default)]
        day_of_month: Option<u32>,
    },
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(format!("end_date {end} is before start_date {start}"));
            }
        }
        match &self.recurrence {
            Some(Recurrence::Weekly { days_of_week }) => {
                if let Some(bad) = days_of_week.iter().find(|d| !(1..=7).contains(*d)) {
                    return Err(format!("days_of_week entry {bad} is outside 1..=7"));
                }
                if days_of_week.is_empty() && self.start_date.is_none() {
                    return Err("weekly recurrence needs days_of_week or a start_date".into());
                }
            }
            Some(Recurrence::Monthly { day_of_month }) => match day_of_month {
                Some(d) if !(1..=31).contains(d) => {
                    return Err(format!("day_of_month {d} is outside 1..=31"));
                }
                None if self.start_date.is_none() => {
                    return Err("monthly recurrence needs day_of_month or a start_date".into());
                }
                _ => {}
            },
            Some(Recurrence::Daily) | None => {}
        }
        Ok(())
    }

    /// Whether `now` falls inside this schedule. `fallback_tz` is used when
    /// the schedule doesn't name its own zone; UTC when neither does.
    pub fn is_eligible(&self, now: DateTime<Utc>, fallback_tz: Option<Tz>) -> bool {
        let tz = self.timezone.or(fallback_tz).unwrap_or(Tz::UTC);
        let local = now.with_timezone(&tz);
        let date = local.date_naive();

        if self.start_date.is_some_and(|start| date < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| date > end) {
            return false;
        }
        if !self.time_matches(local.time()) {
            return false;
        }
        self.recurrence_matches(date)
    }

    fn time_matches(&self, t: NaiveTime) -> bool {
        match (self.start_time, self.end_time) {
            (None, None) => true,
            (Some(start), None) => t >= start,
            (None, Some(end)) => t <= end,
            (Some(start), Some(end)) if start <= end => start <= t && t <= end,
            // Crosses midnight: [start, 24:00) or [00:00, end].
            (Some(start), Some(end)) => t >= start || t <= end,
        }
    }

    fn recurrence_matches(&self, date: NaiveDate) -> bool {
        match &self.recurrence {
            None | Some(Recurrence::Daily) => true,
            Some(Recurrence::Weekly { days_of_week }) => {
                if days_of_week.is_empty() {
                    return self
                        .start_date
                        .map_or(true, |start| start.weekday() == date.weekday());
                }
                let iso = date.weekday().number_from_monday() as u8;
                days_of_week.contains(&iso)
            }
            Some(Recurrence::Monthly { day_of_month }) => {
                match day_of_month.or_else(|| self.start_date.map(|d| d.day())) {
                    Some(day) => date.day() == day,
                    None => true,
                }
            }
        }
    }
}

/// One device→playlist assignment, flattened with what the resolver needs
/// from the playlist itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub playlist_id: String,
    pub priority: i64,
    pub assigned_at: DateTime<Utc>,
    pub is_active: bool,
    pub schedule: Option<ScheduleConfig>,
    pub schedule_override: Option<ScheduleConfig>,
}

impl Assignment {
    pub fn effective_schedule(&self) -> Option<&ScheduleConfig> {
        self.schedule_override.as_ref().or(self.schedule.as_ref())
    }

    pub fn is_eligible(&self, now: DateTime<Utc>, device_tz: Option<Tz>) -> bool {
        self.is_active
            && self
                .effective_schedule()
                .map_or(true, |s| s.is_eligible(now, device_tz))
    }
}

/// Highest priority first, then most recently assigned, then playlist id.
fn precedence(a: &Assignment, b: &Assignment) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.assigned_at.cmp(&a.assigned_at))
        .then_with(|| a.playlist_id.cmp(&b.playlist_id))
}

/// Picks the playlist that should be playing at `now`, if any.
pub fn resolve(
    assignments: &[Assignment],
    now: DateTime<Utc>,
    device_tz: Option<Tz>,
) -> Option<&Assignment> {
    assignments
        .iter()
        .filter(|a| a.is_eligible(now, device_tz))
        .min_by(|a, b| precedence(a, b))
}

/// Accepts "HH:MM" or "HH:MM:SS"; always writes "HH:MM:SS".
mod time_of_day {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(t) => serializer.serialize_str(&t.format("%H:%M:%S").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            NaiveTime::parse_from_str(&s, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
                .map_err(|_| serde::de::Error::custom(format!("invalid time of day: {s:?}")))
        })
        .transpose()
    }
}
