use chrono::{DateTime, Datelike, FixedOffset, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const MIN_PERIOD_TARGET: f64 = 5.0;
pub const MAX_PERIOD_TARGET: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
        Self::Sun,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % 7]
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn plus(self, days: usize) -> Self {
        Self::from_index(self.index() + days)
    }
}

/// Weekdays a period applies to. Persisted with full lowercase day names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Days {
    #[serde(default = "active")]
    pub monday: bool,
    #[serde(default = "active")]
    pub tuesday: bool,
    #[serde(default = "active")]
    pub wednesday: bool,
    #[serde(default = "active")]
    pub thursday: bool,
    #[serde(default = "active")]
    pub friday: bool,
    #[serde(default = "active")]
    pub saturday: bool,
    #[serde(default = "active")]
    pub sunday: bool,
}

fn active() -> bool {
    true
}

impl Default for Days {
    fn default() -> Self {
        Self::all()
    }
}

impl Days {
    pub fn all() -> Self {
        Self::only(&DayOfWeek::ALL)
    }

    pub fn only(days: &[DayOfWeek]) -> Self {
        let on = |day: DayOfWeek| days.contains(&day);
        Self {
            monday: on(DayOfWeek::Mon),
            tuesday: on(DayOfWeek::Tue),
            wednesday: on(DayOfWeek::Wed),
            thursday: on(DayOfWeek::Thu),
            friday: on(DayOfWeek::Fri),
            saturday: on(DayOfWeek::Sat),
            sunday: on(DayOfWeek::Sun),
        }
    }

    pub fn weekdays() -> Self {
        Self::only(&DayOfWeek::ALL[..5])
    }

    pub fn weekend() -> Self {
        Self::only(&DayOfWeek::ALL[5..])
    }

    pub fn is_active(&self, day: DayOfWeek) -> bool {
        match day {
            DayOfWeek::Mon => self.monday,
            DayOfWeek::Tue => self.tuesday,
            DayOfWeek::Wed => self.wednesday,
            DayOfWeek::Thu => self.thursday,
            DayOfWeek::Fri => self.friday,
            DayOfWeek::Sat => self.saturday,
            DayOfWeek::Sun => self.sunday,
        }
    }

    pub fn shares_day_with(&self, other: &Days) -> bool {
        DayOfWeek::ALL
            .iter()
            .any(|day| self.is_active(*day) && other.is_active(*day))
    }

    /// These days minus every day active in `other`.
    pub fn without(&self, other: &Days) -> Days {
        let kept: Vec<DayOfWeek> = DayOfWeek::ALL
            .into_iter()
            .filter(|day| self.is_active(*day) && !other.is_active(*day))
            .collect();
        Self::only(&kept)
    }

    pub fn is_empty(&self) -> bool {
        !DayOfWeek::ALL.iter().any(|day| self.is_active(*day))
    }
}

fn new_period_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A `[start, end)` window in decimal hours with a target temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub start: f64,
    pub end: f64,
    pub target: f64,
    #[serde(default)]
    pub days: Days,
    #[serde(default = "new_period_id")]
    pub id: String,
}

impl Period {
    pub fn new(start: f64, end: f64, target: f64, days: Days) -> Self {
        Self {
            start,
            end,
            target,
            days,
            id: new_period_id(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidPeriod {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if !self.start.is_finite() || !self.end.is_finite() || !self.target.is_finite() {
            return Err(invalid("values must be finite"));
        }
        if self.start < 0.0 || self.end > 24.0 {
            return Err(invalid("window must lie within 0..24 hours"));
        }
        if self.start >= self.end {
            return Err(invalid("start must be before end"));
        }
        if !(MIN_PERIOD_TARGET..=MAX_PERIOD_TARGET).contains(&self.target) {
            return Err(invalid("target outside supported range"));
        }
        if self.days.is_empty() {
            return Err(invalid("no active days"));
        }
        Ok(())
    }

    pub fn contains(&self, hour: f64) -> bool {
        self.start <= hour && hour < self.end
    }

    pub fn same_window(&self, other: &Period) -> bool {
        self.start == other.start && self.end == other.end
    }

    /// True when both periods share a weekday and their windows intersect.
    pub fn overlaps(&self, other: &Period) -> bool {
        self.days.shares_day_with(&other.days) && self.start < other.end && other.start < self.end
    }
}

/// Weekly program for a zone. Periods are kept sorted by start and never
/// overlap on a shared weekday.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    periods: Vec<Period>,
}

impl Schedule {
    pub fn new(periods: Vec<Period>) -> Result<Self, ValidationError> {
        for period in &periods {
            period.validate()?;
        }
        for (i, a) in periods.iter().enumerate() {
            if let Some(b) = periods[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(ValidationError::Overlap {
                    new: b.id.clone(),
                    existing: a.id.clone(),
                });
            }
        }

        let mut schedule = Self { periods };
        schedule.sort();
        Ok(schedule)
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// Adds a period. An existing period with the same window gives up the
    /// days the new one claims and is dropped once it has none left. Returns
    /// `Ok(false)` when the period is already present.
    pub fn add_period(&mut self, period: Period) -> Result<bool, ValidationError> {
        period.validate()?;
        if self.periods.contains(&period) {
            return Ok(false);
        }

        if let Some(conflict) = self
            .periods
            .iter()
            .filter(|existing| existing.id != period.id && !existing.same_window(&period))
            .find(|existing| existing.overlaps(&period))
        {
            return Err(ValidationError::Overlap {
                new: period.id.clone(),
                existing: conflict.id.clone(),
            });
        }

        let periods = std::mem::take(&mut self.periods);
        self.periods = periods
            .into_iter()
            .filter(|existing| existing.id != period.id)
            .filter_map(|mut existing| {
                if existing.same_window(&period) {
                    existing.days = existing.days.without(&period.days);
                }
                (!existing.days.is_empty()).then_some(existing)
            })
            .collect();
        self.periods.push(period);
        self.sort();
        Ok(true)
    }

    pub fn remove_period(&mut self, id: &str) -> bool {
        let before = self.periods.len();
        self.periods.retain(|period| period.id != id);
        self.periods.len() != before
    }

    pub fn current_period(&self, now: DateTime<FixedOffset>) -> Option<&Period> {
        let day = DayOfWeek::from_chrono(now.weekday());
        let hour = decimal_hour(now);
        self.periods
            .iter()
            .find(|period| period.days.is_active(day) && period.contains(hour))
    }

    pub fn current_target(&self, now: DateTime<FixedOffset>, fallback: f64) -> f64 {
        self.current_period(now)
            .map(|period| period.target)
            .unwrap_or(fallback)
    }

    /// Target of the first period today that has not yet ended, else of the
    /// earliest period on the next active weekday.
    pub fn next_target(&self, now: DateTime<FixedOffset>, fallback: f64) -> f64 {
        let today = DayOfWeek::from_chrono(now.weekday());
        let hour = decimal_hour(now);

        if let Some(period) = self
            .periods
            .iter()
            .find(|period| period.days.is_active(today) && period.end > hour)
        {
            return period.target;
        }

        (1..=7)
            .map(|offset| today.plus(offset))
            .find_map(|day| self.periods.iter().find(|period| period.days.is_active(day)))
            .map(|period| period.target)
            .unwrap_or(fallback)
    }

    fn sort(&mut self) {
        self.periods
            .sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));
    }
}

/// Hour of day with minutes as a fraction, e.g. 07:30 -> 7.5.
pub fn decimal_hour(now: DateTime<FixedOffset>) -> f64 {
    now.hour() as f64 + now.minute() as f64 / 60.0
}
