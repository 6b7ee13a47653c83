use chrono::{Datelike, Duration, NaiveDate};

/// School weekday, ordered Monday-first to match timetable rows.
///
/// `chrono::Weekday` already numbers days from Monday, but every conversion
/// in the engine goes through this enum so the remapping lives in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub fn from_chrono(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self::from_chrono(date.weekday())
    }

    /// Row index into a timetable template value (Monday = 0 .. Sunday = 6).
    pub fn index(self) -> usize {
        self as usize
    }
}

/// ISO week key: (iso year, iso week number). Lessons are grouped and
/// matched within one of these, independent of weekday.
pub type WeekKey = (i32, u32);

pub fn week_key(date: NaiveDate) -> WeekKey {
    let iso = date.iso_week();
    (iso.year(), iso.week())
}

/// Floors a date to the Monday of its ISO week.
pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(Weekday::from_date(date).index() as i64)
}

pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok()
}

/// Resolves which sub-period of a period a date falls in.
///
/// `pairs` is the period value: ordered `[start, end]` date-string pairs, one
/// per sub-period. Returns the 1-based sub-period index, or 0 for vacation
/// (before the first sub-period, in a gap between sub-periods, or after the
/// last one). Malformed pairs are skipped, never fatal.
///
/// Out-of-order or overlapping entries are treated as contiguous: if a pair's
/// start does not advance past the previous pair's start, it is collapsed to
/// begin where the previous pair ended.
pub fn resolve_key(pairs: &[(String, String)], date: NaiveDate) -> usize {
    let mut prev: Option<(NaiveDate, NaiveDate)> = None;
    let mut key = 0;
    for (raw_start, raw_end) in pairs {
        let (Some(mut start), Some(end)) = (parse_iso_date(raw_start), parse_iso_date(raw_end))
        else {
            key += 1;
            continue;
        };
        key += 1;
        if let Some((prev_start, prev_end)) = prev {
            if start <= prev_start {
                start = prev_end;
            }
        }
        if start <= date && date <= end {
            return key;
        }
        prev = Some((start, end));
    }
    0
}

/// Like `resolve_key`, but tolerates being called near a sub-period boundary:
/// when the exact date resolves to vacation, probes 15 days either side.
pub fn resolve_by_approx_date(pairs: &[(String, String)], date: NaiveDate) -> usize {
    let exact = resolve_key(pairs, date);
    if exact != 0 {
        return exact;
    }
    let before = resolve_key(pairs, date - Duration::days(15));
    if before != 0 {
        return before;
    }
    resolve_key(pairs, date + Duration::days(15))
}

/// First parsable sub-period start and last parsable sub-period end.
pub fn period_bounds(pairs: &[(String, String)]) -> Option<(NaiveDate, NaiveDate)> {
    let mut start: Option<NaiveDate> = None;
    let mut end: Option<NaiveDate> = None;
    for (raw_start, raw_end) in pairs {
        if start.is_none() {
            start = parse_iso_date(raw_start);
        }
        if let Some(e) = parse_iso_date(raw_end) {
            end = Some(e);
        }
    }
    match (start, end) {
        (Some(s), Some(e)) if s <= e => Some((s, e)),
        _ => None,
    }
}

/// Recurring public holidays as inclusive (month, day) ranges, compared
/// independently of year. A range whose start is after its end wraps over
/// year-end (New Year's break).
const HOLIDAYS: &[((u32, u32), (u32, u32))] = &[
    ((12, 31), (1, 2)), // New Year
    ((3, 8), (3, 8)),   // Women's Day
    ((3, 21), (3, 22)), // Navruz
    ((5, 9), (5, 9)),   // Memorial Day
    ((9, 1), (9, 1)),   // Independence Day
    ((10, 1), (10, 1)), // Teachers' Day
    ((12, 8), (12, 8)), // Constitution Day
];

pub fn is_holiday(date: NaiveDate) -> bool {
    let md = (date.month(), date.day());
    HOLIDAYS.iter().any(|&(start, end)| {
        if start <= end {
            start <= md && md <= end
        } else {
            md >= start || md <= end
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn resolve_key_quarter_boundaries() {
        let value = pairs(&[("2024-09-01", "2024-10-22"), ("2024-10-31", "2024-12-29")]);
        assert_eq!(resolve_key(&value, d("2024-09-15")), 1);
        assert_eq!(resolve_key(&value, d("2024-11-10")), 2);
        // Gap between quarters is vacation.
        assert_eq!(resolve_key(&value, d("2024-10-25")), 0);
        // Before and after the whole period.
        assert_eq!(resolve_key(&value, d("2024-08-20")), 0);
        assert_eq!(resolve_key(&value, d("2025-01-05")), 0);
        // Inclusive edges.
        assert_eq!(resolve_key(&value, d("2024-09-01")), 1);
        assert_eq!(resolve_key(&value, d("2024-10-22")), 1);
        assert_eq!(resolve_key(&value, d("2024-10-31")), 2);
        assert_eq!(resolve_key(&value, d("2024-12-29")), 2);
    }

    #[test]
    fn resolve_key_collapses_out_of_order_pairs() {
        // Second pair starts before the first: treated as contiguous with it.
        let value = pairs(&[("2024-09-01", "2024-10-22"), ("2024-08-15", "2024-12-29")]);
        assert_eq!(resolve_key(&value, d("2024-10-25")), 2);
        assert_eq!(resolve_key(&value, d("2024-09-15")), 1);
    }

    #[test]
    fn resolve_key_skips_malformed_pairs() {
        let value = pairs(&[("", ""), ("2024-11-01", "2024-12-20"), ("bogus", "2025-01-01")]);
        assert_eq!(resolve_key(&value, d("2024-11-15")), 2);
        assert_eq!(resolve_key(&value, d("2024-10-01")), 0);
    }

    #[test]
    fn resolve_by_approx_date_probes_both_sides() {
        let value = pairs(&[("2024-09-01", "2024-10-22")]);
        assert_eq!(resolve_by_approx_date(&value, d("2024-08-25")), 1);
        assert_eq!(resolve_by_approx_date(&value, d("2024-10-30")), 1);
        assert_eq!(resolve_by_approx_date(&value, d("2025-03-01")), 0);
    }

    #[test]
    fn holiday_table_wraps_year_end() {
        assert!(is_holiday(d("2024-12-31")));
        assert!(is_holiday(d("2025-01-01")));
        assert!(is_holiday(d("2025-01-02")));
        assert!(is_holiday(d("2024-03-21")));
        assert!(is_holiday(d("2024-09-01")));
        assert!(!is_holiday(d("2024-06-15")));
        assert!(!is_holiday(d("2025-01-03")));
    }

    #[test]
    fn monday_floor_and_weekday_index() {
        assert_eq!(monday_of(d("2024-09-05")), d("2024-09-02"));
        assert_eq!(monday_of(d("2024-09-02")), d("2024-09-02"));
        assert_eq!(monday_of(d("2024-09-08")), d("2024-09-02"));
        assert_eq!(Weekday::from_date(d("2024-09-02")).index(), 0);
        assert_eq!(Weekday::from_date(d("2024-09-08")).index(), 6);
    }

    #[test]
    fn period_bounds_skip_malformed_entries() {
        let value = pairs(&[("", ""), ("2024-09-01", "2024-10-22"), ("2024-10-31", "nope")]);
        assert_eq!(
            period_bounds(&value),
            Some((d("2024-09-01"), d("2024-10-22")))
        );
        assert_eq!(period_bounds(&pairs(&[("x", "y")])), None);
    }
}
