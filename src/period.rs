use chrono::{Datelike, NaiveDate};

/// Pseudo-term meaning "whole academic year" in report contexts.
pub const TERM_WHOLE_YEAR: u32 = 5;

/// Academic year containing `date`, formatted "2024-2025".
/// The year boundary is month 8: August already belongs to the next year.
pub fn academic_year(date: NaiveDate) -> String {
    let year = date.year();
    if date.month() >= 8 {
        format!("{}-{}", year, year + 1)
    } else {
        format!("{}-{}", year - 1, year)
    }
}

/// Term (1..=4) containing `date`. June and July belong to no term.
pub fn term(date: NaiveDate) -> Option<u32> {
    match date.month() {
        8 | 9 | 10 => Some(1),
        11 | 12 => Some(2),
        1 | 2 | 3 => Some(3),
        4 | 5 => Some(4),
        _ => None,
    }
}

pub fn term_title(term: u32) -> &'static str {
    match term {
        1 => "I четверть",
        2 => "II четверть",
        3 => "III четверть",
        4 => "IV четверть",
        _ => "весь учебный год",
    }
}

/// The bulk level-up action is only allowed at the end of the school year.
pub fn can_level_up(date: NaiveDate) -> bool {
    matches!(date.month(), 5 | 6)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}
