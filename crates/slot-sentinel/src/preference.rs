//! Operator preferences: which days and which times are worth claiming.
//!
//! Days are matched against poll payloads before a claim is triggered;
//! times are matched against sub-unit labels inside the claim sequence.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::grab::UnitRef;

/// Fields probed, in order, for a date inside a unit object.
const DATE_FIELDS: &[&str] = &[
    "start",
    "startDate",
    "date",
    "slotDate",
    "slotStart",
    "startTime",
    "end",
    "endDate",
    "endTime",
];

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("date regex is valid"))
}

fn range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(\d{1,2}\s*[ap]m|\d{1,2}:\d{2})\s*-\s*(\d{1,2}\s*[ap]m|\d{1,2}:\d{2})$")
            .expect("time range regex is valid")
    })
}

fn time_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\d{1,2}\s*[ap]m|\d{1,2}:\d{2}").expect("time token regex is valid")
    })
}

/// Parse a day list such as `"3,5,10-12"` into sorted, unique days of month.
///
/// Out-of-range numbers and malformed parts are skipped, never an error.
pub fn parse_preferred_days(input: &str) -> Vec<u8> {
    let mut days = BTreeSet::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let (Ok(start), Ok(end)) = (start.trim().parse::<u8>(), end.trim().parse::<u8>())
            else {
                continue;
            };
            if start >= 1 && end <= 31 && start <= end {
                days.extend(start..=end);
            }
        } else if let Ok(day) = part.parse::<u8>() {
            if (1..=31).contains(&day) {
                days.insert(day);
            }
        }
    }
    days.into_iter().collect()
}

/// Day of month of every unit that carries a recognizable `YYYY-MM-DD` date.
///
/// Known date fields are tried first, then the whole serialized object. When
/// no unit yields a day, the request URL is searched as a last resort.
pub fn extract_unit_days(units: &[Value], request_url: Option<&str>) -> Vec<u8> {
    let mut days = Vec::new();
    for unit in units.iter().filter(|u| u.is_object()) {
        let from_fields = DATE_FIELDS
            .iter()
            .filter_map(|field| unit.get(*field))
            .find_map(|value| match value {
                Value::String(s) => day_of(s),
                other => day_of(&other.to_string()),
            });
        if let Some(day) = from_fields.or_else(|| day_of(&unit.to_string())) {
            days.push(day);
        }
    }
    if days.is_empty() && !units.is_empty() {
        tracing::debug!(units = units.len(), "no dates found in unit objects");
    }
    if days.is_empty() {
        if let Some(day) = request_url.and_then(day_of) {
            days.push(day);
        }
    }
    days
}

fn day_of(text: &str) -> Option<u8> {
    date_re()
        .captures(text)
        .and_then(|caps| caps.get(3))
        .and_then(|m| m.as_str().parse().ok())
}

/// Outcome of checking a poll payload against the preferred days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayMatch {
    /// No preference configured.
    Unrestricted,
    /// At least one unit falls on a preferred day.
    Matched(Vec<u8>),
    /// Units carry days, none of them preferred.
    Rejected(Vec<u8>),
    /// Days could not be extracted; the page-level filter decides.
    Undetermined,
}

impl DayMatch {
    pub fn allows_claim(&self) -> bool {
        !matches!(self, DayMatch::Rejected(_))
    }
}

/// Check unit days against a preference string.
pub fn match_days(preferred: &str, units: &[Value], request_url: Option<&str>) -> DayMatch {
    let wanted = parse_preferred_days(preferred);
    if wanted.is_empty() {
        return DayMatch::Unrestricted;
    }
    let found = extract_unit_days(units, request_url);
    if found.is_empty() {
        return DayMatch::Undetermined;
    }
    let mut unique: Vec<u8> = found.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    if found.iter().any(|day| wanted.contains(day)) {
        unique.retain(|day| wanted.contains(day));
        DayMatch::Matched(unique)
    } else {
        DayMatch::Rejected(unique)
    }
}

/// Minutes since midnight for `"9am"`, `"12 pm"` or `"16:30"`.
fn parse_minutes(text: &str) -> Option<u32> {
    let text = text.trim().to_ascii_lowercase();
    if let Some(meridiem) = text.strip_suffix("am").or_else(|| text.strip_suffix("pm")) {
        let is_pm = text.ends_with("pm");
        let hour: u32 = meridiem.trim().parse().ok()?;
        if !(1..=12).contains(&hour) {
            return None;
        }
        let hour = match (hour, is_pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
        return Some(hour * 60);
    }
    let (hour, minute) = text.split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    (hour <= 23 && minute <= 59).then_some(hour * 60 + minute)
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Whether every time mentioned in `label` falls inside `range`.
///
/// `range` is `"9am-4pm"` or `"09:00-16:00"`. Anything else is matched as a
/// case-insensitive substring of the label.
pub fn time_in_range(label: &str, range: &str) -> bool {
    let range = range.trim();
    if range.is_empty() {
        return false;
    }
    let bounds = range_re()
        .captures(range)
        .and_then(|caps| Some((parse_minutes(&caps[1])?, parse_minutes(&caps[2])?)));
    let Some((start, end)) = bounds else {
        return normalize_ws(label).contains(&normalize_ws(range));
    };

    let minutes: Vec<u32> = time_token_re()
        .find_iter(label)
        .filter_map(|m| parse_minutes(m.as_str()))
        .collect();
    !minutes.is_empty() && minutes.iter().all(|m| (start..=end).contains(m))
}

/// Sub-units to activate, in rank order.
///
/// With a preference, every matching candidate is chosen; if none match the
/// top-ranked candidate is used instead. Without one, only the top-ranked.
pub fn choose_sub_units(candidates: &[UnitRef], preferred_time: &str) -> SubunitChoice {
    let Some(first) = candidates.first() else {
        return SubunitChoice::default();
    };
    if preferred_time.trim().is_empty() {
        return SubunitChoice {
            units: vec![first.clone()],
            fell_back: false,
        };
    }
    let matching: Vec<UnitRef> = candidates
        .iter()
        .filter(|c| time_in_range(&c.label, preferred_time))
        .cloned()
        .collect();
    if matching.is_empty() {
        SubunitChoice {
            units: vec![first.clone()],
            fell_back: true,
        }
    } else {
        SubunitChoice {
            units: matching,
            fell_back: false,
        }
    }
}

/// Result of [`choose_sub_units`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubunitChoice {
    pub units: Vec<UnitRef>,
    /// The preference matched nothing and the top-ranked unit was used.
    pub fell_back: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(label: &str) -> UnitRef {
        UnitRef::new(label, label)
    }

    #[test]
    fn test_parse_days_ranges_and_singles() {
        assert_eq!(parse_preferred_days("3, 5,10-12"), vec![3, 5, 10, 11, 12]);
        assert_eq!(parse_preferred_days("7,7,1"), vec![1, 7]);
    }

    #[test]
    fn test_parse_days_skips_garbage() {
        assert_eq!(parse_preferred_days(""), Vec::<u8>::new());
        assert_eq!(parse_preferred_days("0,32,abc,12-9,4"), vec![4]);
        assert_eq!(parse_preferred_days("28-35"), Vec::<u8>::new());
    }

    #[test]
    fn test_extract_days_from_known_fields() {
        let units = vec![
            json!({"startDate": "2025-03-14T09:00:00Z"}),
            json!({"meta": {"when": "2025-03-20"}}),
            json!({"id": 7}),
        ];
        assert_eq!(extract_unit_days(&units, None), vec![14, 20]);
    }

    #[test]
    fn test_extract_days_url_fallback() {
        let units = vec![json!({"id": 1})];
        let url = "https://host/inbound-scheduler/capacity?date=2025-04-09";
        assert_eq!(extract_unit_days(&units, Some(url)), vec![9]);
    }

    #[test]
    fn test_match_days() {
        let units = vec![json!({"date": "2025-03-05"}), json!({"date": "2025-03-06"})];
        assert_eq!(match_days("", &units, None), DayMatch::Unrestricted);
        assert_eq!(match_days("6-8", &units, None), DayMatch::Matched(vec![6]));
        assert_eq!(match_days("1", &units, None), DayMatch::Rejected(vec![5, 6]));
        assert!(!match_days("1", &units, None).allows_claim());
        assert_eq!(match_days("1", &[json!({})], None), DayMatch::Undetermined);
    }

    #[test]
    fn test_time_in_range_meridiem() {
        assert!(time_in_range("From 9am - To 11am", "9am-4pm"));
        assert!(!time_in_range("From 3pm - To 5pm", "9am-4pm"));
        assert!(time_in_range("12 pm - 1 pm", "12pm-2pm"));
    }

    #[test]
    fn test_time_in_range_24h_and_substring() {
        assert!(time_in_range("09:30 - 10:30", "09:00-16:00"));
        assert!(!time_in_range("No times listed", "09:00-16:00"));
        assert!(time_in_range("Morning  Slot A", "morning slot"));
        assert!(!time_in_range("anything", "  "));
    }

    #[test]
    fn test_choose_sub_units() {
        let cands = vec![unit("7am - 9am"), unit("10am - 12pm"), unit("1pm - 3pm")];

        let none = choose_sub_units(&cands, "");
        assert_eq!(none.units, vec![cands[0].clone()]);

        let pref = choose_sub_units(&cands, "10am-4pm");
        assert_eq!(pref.units, vec![cands[1].clone(), cands[2].clone()]);
        assert!(!pref.fell_back);

        let miss = choose_sub_units(&cands, "5pm-8pm");
        assert_eq!(miss.units, vec![cands[0].clone()]);
        assert!(miss.fell_back);

        assert!(choose_sub_units(&[], "9am-4pm").units.is_empty());
    }
}
