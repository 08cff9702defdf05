use serde::{Deserialize, Serialize};

pub const WEEK_MIN: u32 = 1;
pub const WEEK_MAX: u32 = 53;

/// First week of the "new" school year under the fixed-threshold year
/// mapping: weeks 30..53 belong to the calendar year the school year
/// starts in, weeks 1..29 to the year it ends in.
pub const SUMMER_THRESHOLD_WEEK: u32 = 30;

/// Coerce anything JSON gave us into a week number in [1, 53].
/// NaN/non-finite inputs fall back to 1 (the week-range default).
pub fn clamp_week(n: f64) -> u32 {
    if !n.is_finite() {
        return WEEK_MIN;
    }
    let n = n.trunc();
    if n < WEEK_MIN as f64 {
        WEEK_MIN
    } else if n > WEEK_MAX as f64 {
        WEEK_MAX
    } else {
        n as u32
    }
}

pub fn clamp_week_i64(n: i64) -> u32 {
    clamp_week(n as f64)
}

/// Ordered week numbers from `start` to `end` inclusive, stepping +1 and
/// wrapping past year-end. The wrap cap is 53 only when an endpoint
/// actually touches week 53; a plan that never uses week 53 cycles 1..52.
/// A hard bound of 52 steps keeps degenerate inputs finite.
pub fn week_sequence(start: u32, end: u32) -> Vec<u32> {
    let start = clamp_week(start as f64);
    let end = clamp_week(end as f64);
    let cap = if start == WEEK_MAX || end == WEEK_MAX {
        WEEK_MAX
    } else {
        52
    };

    let mut weeks = Vec::new();
    let mut current = start;
    weeks.push(current);
    let mut steps = 0;
    while current != end && steps < 52 {
        current = if current >= cap { WEEK_MIN } else { current + 1 };
        weeks.push(current);
        steps += 1;
    }
    weeks
}

/// Single source of truth for "does this week fall inside this span".
/// The three-way branch is deliberate: equal endpoints cover exactly one
/// week, ordered endpoints cover the closed interval, and an inverted
/// span wraps past year-end (week >= start OR week <= end).
pub fn span_covers_week(week_start: u32, week_end: u32, week: u32) -> bool {
    let start = clamp_week(week_start as f64);
    let end = clamp_week(week_end as f64);
    let week = clamp_week(week as f64);

    if start == end {
        week == start
    } else if start < end {
        week >= start && week <= end
    } else {
        week >= start || week <= end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolYearSpan {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_year: Option<i32>,
}

fn four_digit_at(bytes: &[u8], i: usize) -> Option<i32> {
    if i + 4 > bytes.len() {
        return None;
    }
    let run = &bytes[i..i + 4];
    if !run.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // A 5+ digit run is not a year.
    if bytes.get(i + 4).map(|b| b.is_ascii_digit()).unwrap_or(false) {
        return None;
    }
    std::str::from_utf8(run).ok()?.parse::<i32>().ok()
}

/// Extract (startYear, endYear) from "YYYY-YYYY", "YYYY/YYYY" or a bare
/// "YYYY" (end = start + 1). No 4-digit year found → empty span. Total.
pub fn parse_school_year(s: &str) -> SchoolYearSpan {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            if let Some(start) = four_digit_at(bytes, i) {
                // Optional "-YYYY" / "/YYYY" tail.
                let sep = i + 4;
                if bytes.get(sep) == Some(&b'-') || bytes.get(sep) == Some(&b'/') {
                    if let Some(end) = four_digit_at(bytes, sep + 1) {
                        return SchoolYearSpan {
                            start_year: Some(start),
                            end_year: Some(end),
                        };
                    }
                }
                return SchoolYearSpan {
                    start_year: Some(start),
                    end_year: Some(start + 1),
                };
            }
            // Skip the whole digit run, it is not a year.
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    SchoolYearSpan::default()
}

/// Which calendar year a week number falls in, given the school-year
/// boundary. Two policies exist; `SummerThreshold` is the current default
/// (fixed week-30 boundary), `RangeRelative` reproduces the older
/// relative-to-plan-range mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum YearPolicy {
    #[default]
    SummerThreshold,
    RangeRelative,
}

pub fn year_for_week(
    week: u32,
    range_start: u32,
    range_end: u32,
    span: SchoolYearSpan,
    fallback_year: i32,
    policy: YearPolicy,
) -> i32 {
    let week = clamp_week(week as f64);
    let start_year = span.start_year.unwrap_or(fallback_year);
    let end_year = span.end_year.unwrap_or(fallback_year);

    match policy {
        YearPolicy::SummerThreshold => {
            if week >= SUMMER_THRESHOLD_WEEK {
                start_year
            } else {
                end_year
            }
        }
        YearPolicy::RangeRelative => {
            let range_start = clamp_week(range_start as f64);
            let range_end = clamp_week(range_end as f64);
            if week >= range_start {
                start_year
            } else if week <= range_end {
                end_year
            } else {
                fallback_year
            }
        }
    }
}

pub fn format_school_year(start_year: i32) -> String {
    format!("{}-{}", start_year, start_year + 1)
}

/// Input mask for school-year text fields: keep digits only, insert the
/// dash after the fourth digit, cap at eight digits.
pub fn mask_school_year_input(s: &str) -> String {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).take(8).collect();
    if digits.len() <= 4 {
        digits
    } else {
        format!("{}-{}", &digits[..4], &digits[4..])
    }
}
