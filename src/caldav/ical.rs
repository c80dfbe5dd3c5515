// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use chrono::{DateTime, NaiveDateTime, Utc};
use icalendar::{CalendarComponent, Component, parser};

use crate::error::CalBridgeError;

/// The subset of an iCalendar object this engine cares about. Everything
/// else in the body is passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub uid: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub dtstamp: Option<DateTime<Utc>>,
}

impl ParsedEvent {
    /// `LAST-MODIFIED`, falling back to `DTSTAMP`, as spec.md's
    /// `latest_wins` comparison requires.
    pub fn comparison_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_modified.or(self.dtstamp)
    }
}

/// Extract UID, LAST-MODIFIED, and DTSTAMP from a raw iCalendar body. The
/// engine never validates calendar semantics beyond this.
pub fn parse_event(ical_body: &str) -> Result<ParsedEvent, CalBridgeError> {
    let unfolded = parser::unfold(ical_body);
    let parsed = parser::read_calendar(&unfolded)
        .map_err(|e| CalBridgeError::Parse(format!("iCalendar parse error: {e}")))?;

    for component in parsed.components {
        if let CalendarComponent::Event(event) = CalendarComponent::from(component) {
            let uid = event
                .get_uid()
                .ok_or_else(|| CalBridgeError::Parse("event missing UID".to_string()))?
                .to_string();

            let last_modified = event
                .property_value("LAST-MODIFIED")
                .and_then(parse_ical_datetime);
            let dtstamp = event
                .property_value("DTSTAMP")
                .and_then(parse_ical_datetime);

            return Ok(ParsedEvent {
                uid,
                last_modified,
                dtstamp,
            });
        }
    }

    Err(CalBridgeError::Parse(
        "no VEVENT component found".to_string(),
    ))
}

fn parse_ical_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%SZ") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\nBEGIN:VEVENT\r\nUID:A@x\r\nDTSTAMP:20250101T000000Z\r\nLAST-MODIFIED:20250102T030000Z\r\nSUMMARY:Test\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn extracts_uid_and_timestamps() {
        let parsed = parse_event(EVENT).unwrap();
        assert_eq!(parsed.uid, "A@x");
        assert!(parsed.last_modified.is_some());
        assert!(parsed.dtstamp.is_some());
    }

    #[test]
    fn comparison_prefers_last_modified_over_dtstamp() {
        let parsed = parse_event(EVENT).unwrap();
        assert_eq!(parsed.comparison_timestamp(), parsed.last_modified);
    }

    #[test]
    fn falls_back_to_dtstamp_when_last_modified_absent() {
        let body = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\nBEGIN:VEVENT\r\nUID:B@x\r\nDTSTAMP:20250101T000000Z\r\nSUMMARY:Test\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let parsed = parse_event(body).unwrap();
        assert!(parsed.last_modified.is_none());
        assert_eq!(parsed.comparison_timestamp(), parsed.dtstamp);
    }

    #[test]
    fn rejects_event_without_uid() {
        let body = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\nBEGIN:VEVENT\r\nDTSTAMP:20250101T000000Z\r\nSUMMARY:No UID\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(parse_event(body).is_err());
    }

    #[test]
    fn rejects_malformed_body() {
        assert!(parse_event("not an ical body at all").is_err());
    }
}
