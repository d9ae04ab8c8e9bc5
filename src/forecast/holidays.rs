//! National holiday calendar used as a regressor by the decomposition model.
//!
//! Fixed-date holidays plus Maundy Thursday and Good Friday, which move with
//! Easter Sunday (anonymous Gregorian computus).

use chrono::{Datelike, Duration, NaiveDate};

const FIXED: [(u32, u32); 10] = [
    (1, 1),   // New Year
    (5, 1),   // Labour Day
    (6, 29),  // Saints Peter and Paul
    (7, 28),  // Independence
    (7, 29),  // Independence
    (8, 30),  // Santa Rosa de Lima
    (10, 8),  // Angamos
    (11, 1),  // All Saints
    (12, 8),  // Immaculate Conception
    (12, 25), // Christmas
];

/// Easter Sunday of `year`.
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// Holidays of one year, sorted.
pub fn national_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days: Vec<NaiveDate> = FIXED
        .iter()
        .filter_map(|(m, d)| NaiveDate::from_ymd_opt(year, *m, *d))
        .collect();
    if let Some(easter) = easter_sunday(year) {
        days.push(easter - Duration::days(3));
        days.push(easter - Duration::days(2));
    }
    days.sort();
    days
}

/// Holidays falling in `[start, end]`.
pub fn holidays_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    (start.year()..=end.year())
        .flat_map(national_holidays)
        .filter(|d| *d >= start && *d <= end)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_easter_dates() {
        assert_eq!(easter_sunday(2024), Some(date(2024, 3, 31)));
        assert_eq!(easter_sunday(2025), Some(date(2025, 4, 20)));
        assert_eq!(easter_sunday(2026), Some(date(2026, 4, 5)));
        assert_eq!(easter_sunday(2019), Some(date(2019, 4, 21)));
    }

    #[test]
    fn test_holy_week_holidays() {
        let days = national_holidays(2025);
        assert_eq!(days.len(), 12);
        assert!(days.contains(&date(2025, 4, 17)));
        assert!(days.contains(&date(2025, 4, 18)));
        assert!(days.contains(&date(2025, 7, 28)));
        assert!(days.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_holidays_between_spans_years() {
        let days = holidays_between(date(2024, 12, 1), date(2025, 1, 31));
        assert_eq!(days, vec![date(2024, 12, 8), date(2024, 12, 25), date(2025, 1, 1)]);
    }
}
