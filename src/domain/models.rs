use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// Daily entries beyond this count are pruned, oldest first.
pub const RETENTION_DAYS: usize = 90;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub date: NaiveDate,
    pub minutes_spent: u32,
}

// Additive unit of a durable flush; deltas for the same date coalesce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntryDelta {
    pub date: NaiveDate,
    pub minutes_delta: u32,
}

// `entries` stays sorted by date descending and capped at RETENTION_DAYS.
// `total_minutes` is a lifetime counter and never decrements when an entry
// ages out; the weekly/monthly fields are recomputed, never patched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub total_minutes: u64,
    pub entries: Vec<TimeEntry>,
    pub weekly_minutes: u64,
    pub monthly_minutes: u64,
}

impl Ledger {
    // Zero minutes reports false so callers can skip the mirror write.
    pub fn record(&mut self, date: NaiveDate, minutes: u32, now: DateTime<Utc>) -> bool {
        if minutes == 0 {
            return false;
        }

        match self.entries.iter_mut().find(|entry| entry.date == date) {
            Some(entry) => entry.minutes_spent += minutes,
            None => self.entries.push(TimeEntry {
                date,
                minutes_spent: minutes,
            }),
        }

        self.entries.sort_by(|a, b| b.date.cmp(&a.date));
        self.entries.truncate(RETENTION_DAYS);
        self.total_minutes += u64::from(minutes);
        self.recompute_derived(now);
        true
    }

    pub fn recompute_derived(&mut self, now: DateTime<Utc>) {
        let week_start = now.date_naive() - chrono::Days::new(7);
        let month_start = now
            .date_naive()
            .checked_sub_months(Months::new(1))
            .unwrap_or(NaiveDate::MIN);

        self.weekly_minutes = self.minutes_since(week_start);
        self.monthly_minutes = self.minutes_since(month_start);
    }

    fn minutes_since(&self, cutoff: NaiveDate) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.date >= cutoff)
            .map(|entry| u64::from(entry.minutes_spent))
            .sum()
    }

    pub fn today_minutes(&self, now: DateTime<Utc>) -> u32 {
        let today = now.date_naive();
        self.entries
            .iter()
            .find(|entry| entry.date == today)
            .map(|entry| entry.minutes_spent)
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.entries.len() > RETENTION_DAYS {
            return Err(format!(
                "ledger.entries exceeds retention window of {RETENTION_DAYS} days"
            ));
        }
        for window in self.entries.windows(2) {
            if window[0].date <= window[1].date {
                return Err(
                    "ledger.entries must be sorted by date descending with no duplicate dates"
                        .to_string(),
                );
            }
        }
        Ok(())
    }
}

pub fn push_delta(pending: &mut Vec<EntryDelta>, date: NaiveDate, minutes: u32) {
    match pending.iter_mut().find(|delta| delta.date == date) {
        Some(delta) => delta.minutes_delta += minutes,
        None => pending.push(EntryDelta {
            date,
            minutes_delta: minutes,
        }),
    }
}

// Restores unacknowledged deltas to the pending batch after a failed flush.
pub fn merge_deltas(pending: &mut Vec<EntryDelta>, unsent: Vec<EntryDelta>) {
    for delta in unsent {
        push_delta(pending, delta.date, delta.minutes_delta);
    }
}
