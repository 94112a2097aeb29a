use crate::domain::models::Ledger;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::Serialize;

// Fixed number of axis ticks a chart draws regardless of data magnitude.
pub const AXIS_TICK_COUNT: u64 = 6;

const ALL_RANGE_MONTHS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesRange {
    Day,
    Week,
    Month,
    Year,
    // Rolling five-year window of monthly buckets ending at the current month.
    All,
}

impl SeriesRange {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub minutes: u64,
}

// `points` and `labels` always have the same length, fixed per range even
// when the ledger is empty.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TimeSeries {
    pub points: Vec<SeriesPoint>,
    pub labels: Vec<String>,
}

struct Bucket {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    label: String,
}

// `offset` shifts the anchor period in whole range units; 0 is the period
// containing `now`. Buckets are generated in full before population, so
// buckets without activity carry an explicit zero.
pub fn build_series(ledger: &Ledger, range: SeriesRange, offset: i32, now: DateTime<Utc>) -> TimeSeries {
    let mut buckets = generate_buckets(range, offset, now);

    let mut points = Vec::with_capacity(buckets.len());
    let mut labels = Vec::with_capacity(buckets.len());
    for bucket in buckets.drain(..) {
        let minutes = ledger
            .entries
            .iter()
            .filter(|entry| {
                let at = day_start(entry.date);
                at >= bucket.start && at < bucket.end
            })
            .map(|entry| u64::from(entry.minutes_spent))
            .sum();
        points.push(SeriesPoint {
            timestamp: bucket.start,
            minutes,
        });
        labels.push(bucket.label);
    }

    TimeSeries { points, labels }
}

// The day range reads in plain minutes; the rest switch to "2h 15min" at
// one hour.
pub fn format_minutes(range: SeriesRange, minutes: u64) -> String {
    if range == SeriesRange::Day || minutes < 60 {
        return format!("{minutes}min");
    }
    format!("{}h {}min", minutes / 60, minutes % 60)
}

// Max rounded up to the nearest 10 and divided into AXIS_TICK_COUNT ticks,
// with a per-range floor so sparse data still gets readable gridlines.
pub fn axis_step(range: SeriesRange, max_minutes: u64) -> u64 {
    let floor = if range == SeriesRange::Day { 10 } else { 5 };
    let rounded = max_minutes.div_ceil(10) * 10;
    (rounded / AXIS_TICK_COUNT).max(floor)
}

fn generate_buckets(range: SeriesRange, offset: i32, now: DateTime<Utc>) -> Vec<Bucket> {
    match range {
        SeriesRange::Day => day_buckets(offset, now),
        SeriesRange::Week => week_buckets(offset, now),
        SeriesRange::Month => month_buckets(offset, now),
        SeriesRange::Year => year_buckets(offset, now),
        SeriesRange::All => rolling_month_buckets(offset, now),
    }
}

fn day_buckets(offset: i32, now: DateTime<Utc>) -> Vec<Bucket> {
    let anchor = now.date_naive() + Duration::days(i64::from(offset));
    let midnight = day_start(anchor);
    (0..24)
        .map(|hour| Bucket {
            start: midnight + Duration::hours(hour),
            end: midnight + Duration::hours(hour + 1),
            label: format!("{hour:02}:00"),
        })
        .collect()
}

fn week_buckets(offset: i32, now: DateTime<Utc>) -> Vec<Bucket> {
    let anchor = now.date_naive() + Duration::weeks(i64::from(offset));
    let monday = anchor.week(Weekday::Mon).first_day();
    (0..7)
        .map(|day| {
            let date = monday + Duration::days(day);
            Bucket {
                start: day_start(date),
                end: day_start(date) + Duration::days(1),
                label: date.format("%a").to_string(),
            }
        })
        .collect()
}

fn month_buckets(offset: i32, now: DateTime<Utc>) -> Vec<Bucket> {
    let first = shift_months(month_floor(now.date_naive()), offset);
    let day_count = days_in_month(first);
    (0..day_count)
        .map(|day| {
            let date = first + Duration::days(day);
            Bucket {
                start: day_start(date),
                end: day_start(date) + Duration::days(1),
                label: date.day().to_string(),
            }
        })
        .collect()
}

fn year_buckets(offset: i32, now: DateTime<Utc>) -> Vec<Bucket> {
    let january = shift_months(
        month_floor(now.date_naive().with_month(1).unwrap_or(now.date_naive())),
        offset.saturating_mul(12),
    );
    (0..12)
        .map(|index| {
            let first = shift_months(january, index);
            Bucket {
                start: day_start(first),
                end: day_start(shift_months(first, 1)),
                label: first.format("%b").to_string(),
            }
        })
        .collect()
}

fn rolling_month_buckets(offset: i32, now: DateTime<Utc>) -> Vec<Bucket> {
    let last = shift_months(month_floor(now.date_naive()), offset);
    let first = shift_months(last, -(ALL_RANGE_MONTHS as i32 - 1));
    (0..ALL_RANGE_MONTHS as i32)
        .map(|index| {
            let month = shift_months(first, index);
            Bucket {
                start: day_start(month),
                end: day_start(shift_months(month, 1)),
                label: month.format("%b").to_string(),
            }
        })
        .collect()
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn month_floor(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn shift_months(date: NaiveDate, offset: i32) -> NaiveDate {
    if offset >= 0 {
        date.checked_add_months(Months::new(offset as u32))
            .unwrap_or(NaiveDate::MAX)
    } else {
        date.checked_sub_months(Months::new(offset.unsigned_abs()))
            .unwrap_or(NaiveDate::MIN)
    }
}

fn days_in_month(first: NaiveDate) -> i64 {
    (shift_months(first, 1) - first).num_days()
}
