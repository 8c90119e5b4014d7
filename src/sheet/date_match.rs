use super::SheetError;
use serde_json::Value;
use std::str::FromStr;
use time::{Date, Duration, Month};

/// A calendar month parsed from `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearMonth {
    pub year: i32,
    pub month: Month,
}

impl FromStr for YearMonth {
    type Err = SheetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SheetError::InvalidDateFormat(s.to_string());

        let (y, m) = s.split_once('-').ok_or_else(invalid)?;
        if y.len() != 4 || !all_digits(y) || m.is_empty() || m.len() > 2 || !all_digits(m) {
            return Err(invalid());
        }
        let year: i32 = y.parse().map_err(|_| invalid())?;
        let month: u8 = m.parse().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        Ok(Self { year, month })
    }
}

impl YearMonth {
    pub fn contains(&self, date: Date) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

fn all_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

/// Day zero of spreadsheet serial dates.
fn serial_epoch() -> Option<Date> {
    Date::from_calendar_date(1899, Month::December, 30).ok()
}

/// Interpret a cell as a date: an integer serial or an `MM/DD/YYYY` string.
pub fn cell_date(cell: &Value) -> Option<Date> {
    match cell {
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            // Out-of-range integers are not dates.
            let days = i32::try_from(n.as_i64()?).ok()?;
            serial_epoch()?.checked_add(Duration::days(i64::from(days)))
        }
        Value::String(s) => parse_us_date(s),
        _ => None,
    }
}

fn parse_us_date(s: &str) -> Option<Date> {
    let mut parts = s.split('/');
    let (m, d, y) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let short_ok = |p: &str| !p.is_empty() && p.len() <= 2 && all_digits(p);
    if !short_ok(m) || !short_ok(d) || y.len() != 4 || !all_digits(y) {
        return None;
    }
    let month = Month::try_from(m.parse::<u8>().ok()?).ok()?;
    Date::from_calendar_date(y.parse().ok()?, month, d.parse().ok()?).ok()
}

/// 1-based index of the first row whose first cell falls in `target`.
pub fn find_row(target: YearMonth, rows: &[Vec<Value>]) -> Option<u32> {
    rows.iter()
        .position(|row| {
            row.first()
                .and_then(cell_date)
                .is_some_and(|d| target.contains(d))
        })
        .and_then(|idx| u32::try_from(idx + 1).ok())
}
