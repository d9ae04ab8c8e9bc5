//! Trailing history buffers for recursive multi-step forecasting.
//!
//! Recursive forecasters append each prediction to a copy of their history
//! before producing the next step. Extension is a pure function so the
//! trained state is never touched by `predict`.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Tail of a weekly series plus the position of the next row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyHistory {
    values: Vec<f64>,
    last_date: NaiveDate,
    /// Index of the next row in the full series (trend position)
    next_index: usize,
    capacity: usize,
}

impl WeeklyHistory {
    /// Keep the last `capacity` values of a series ending at `last_date`.
    pub fn new(values: &[f64], last_date: NaiveDate, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let start = values.len().saturating_sub(capacity);
        Self {
            values: values[start..].to_vec(),
            last_date,
            next_index: values.len(),
            capacity,
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn last_date(&self) -> NaiveDate {
        self.last_date
    }

    pub fn next_date(&self) -> NaiveDate {
        self.last_date + Duration::weeks(1)
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }
}

/// History with one synthetic week appended; the oldest value drops out
/// once the buffer is full.
pub fn extend_history(history: &WeeklyHistory, value: f64) -> WeeklyHistory {
    let mut values = history.values.clone();
    values.push(value);
    if values.len() > history.capacity {
        values.remove(0);
    }
    WeeklyHistory {
        values,
        last_date: history.next_date(),
        next_index: history.next_index + 1,
        capacity: history.capacity,
    }
}

/// Fixed-length window shifted left by one with `value` appended.
pub fn slide_window(window: &[f64], value: f64) -> Vec<f64> {
    let mut next = Vec::with_capacity(window.len());
    if !window.is_empty() {
        next.extend_from_slice(&window[1..]);
        next.push(value);
    }
    next
}

/// The `steps` week starts following `last_date`.
pub fn future_weeks(last_date: NaiveDate, steps: usize) -> Vec<NaiveDate> {
    (1..=steps as i64)
        .map(|i| last_date + Duration::weeks(i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_extend_is_pure() {
        let history = WeeklyHistory::new(&[1.0, 2.0, 3.0], date(2024, 1, 15), 3);
        let extended = extend_history(&history, 4.0);

        assert_eq!(history.values(), &[1.0, 2.0, 3.0]);
        assert_eq!(history.next_index(), 3);

        assert_eq!(extended.values(), &[2.0, 3.0, 4.0]);
        assert_eq!(extended.last_date(), date(2024, 1, 22));
        assert_eq!(extended.next_index(), 4);
    }

    #[test]
    fn test_history_keeps_tail() {
        let history = WeeklyHistory::new(&[1.0, 2.0, 3.0, 4.0, 5.0], date(2024, 1, 1), 2);
        assert_eq!(history.values(), &[4.0, 5.0]);
        assert_eq!(history.next_index(), 5);
    }

    #[test]
    fn test_slide_window() {
        assert_eq!(slide_window(&[1.0, 2.0, 3.0], 9.0), vec![2.0, 3.0, 9.0]);
        assert!(slide_window(&[], 1.0).is_empty());
    }

    #[test]
    fn test_future_weeks() {
        let weeks = future_weeks(date(2024, 12, 23), 2);
        assert_eq!(weeks, vec![date(2024, 12, 30), date(2025, 1, 6)]);
    }
}
