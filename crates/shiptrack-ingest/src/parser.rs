//! Partner response parsing
//!
//! Turns a [`RawResponse`] into per-shipment event groups. Each raw record is
//! parsed on its own and yields a [`RecordOutcome`], so one bad shipment never
//! affects its siblings in the same batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use shiptrack_common::TrackError;
use tracing::{debug, info, warn};

use crate::models::{fields, EventNote, RawRecord, RawResponse, ShipmentEvent, ShipmentEvents};

/// Strict ISO-8601 layout, matched against the first 19 characters
pub const STRICT_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Fallback layouts tried in order when the strict layout does not match
pub const DEFAULT_FALLBACK_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%d %b %Y %H:%M:%S",
    "%b %d, %Y %H:%M",
    "%Y%m%d%H%M%S",
    "%Y-%m-%d",
    "%m/%d/%Y",
];

/// Prefix of the status carried by a shipment whose record the partner could not serve
pub const UPSTREAM_STATUS_PREFIX: &str = "API Response: ";

// ============================================================================
// Timestamps
// ============================================================================

/// Best-effort scan timestamp parsing
#[derive(Debug, Clone)]
pub struct DatetimeParser {
    fallback_formats: Vec<String>,
}

impl Default for DatetimeParser {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_FORMATS.iter().map(|f| f.to_string()))
    }
}

impl DatetimeParser {
    pub fn new<I, S>(fallback_formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fallback_formats: fallback_formats.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a timestamp as wall-clock time.
    ///
    /// Strict `YYYY-MM-DDTHH:MM:SS` first (fractional seconds and offsets are
    /// ignored), then RFC 3339, RFC 2822 and the configured fallback formats.
    /// Date-only formats resolve to midnight.
    pub fn parse(&self, raw: &str) -> Option<NaiveDateTime> {
        let raw = raw.trim();

        if raw.contains('T') && raw.is_char_boundary(19.min(raw.len())) {
            let head = &raw[..19.min(raw.len())];
            if let Ok(parsed) = NaiveDateTime::parse_from_str(head, STRICT_ISO_FORMAT) {
                return Some(parsed);
            }
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.naive_local());
        }
        if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
            return Some(parsed.naive_local());
        }

        for format in &self.fallback_formats {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(parsed);
            }
            if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
                if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                    return Some(midnight);
                }
            }
        }

        None
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of parsing one per-shipment raw record
#[derive(Debug)]
pub enum RecordOutcome {
    /// Identifier, status and every scan extracted
    Parsed(ShipmentEvents),
    /// Usable but incomplete; the reason says what is missing
    Degraded(ShipmentEvents, String),
    /// No tracking identifier, nothing can be keyed
    Failed(TrackError),
}

impl RecordOutcome {
    /// Events worth persisting, if any
    pub fn events(&self) -> Option<&ShipmentEvents> {
        match self {
            RecordOutcome::Parsed(events) | RecordOutcome::Degraded(events, _) => Some(events),
            RecordOutcome::Failed(_) => None,
        }
    }

    pub fn into_events(self) -> Option<ShipmentEvents> {
        match self {
            RecordOutcome::Parsed(events) | RecordOutcome::Degraded(events, _) => Some(events),
            RecordOutcome::Failed(_) => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, RecordOutcome::Degraded(..))
    }
}

/// All outcomes of one batch, in payload order
#[derive(Debug)]
pub struct ParsedBatch {
    pub batch_name: String,
    pub outcomes: Vec<RecordOutcome>,
}

impl ParsedBatch {
    pub fn parsed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Parsed(_)))
            .count()
    }

    pub fn degraded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_degraded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Failed(_)))
            .count()
    }

    pub fn usable_count(&self) -> usize {
        self.parsed_count() + self.degraded_count()
    }

    /// Usable event groups, in payload order
    pub fn events(&self) -> impl Iterator<Item = &ShipmentEvents> {
        self.outcomes.iter().filter_map(RecordOutcome::events)
    }
}

// ============================================================================
// Response Parser
// ============================================================================

/// Pure transformation from raw partner records to shipment events
#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    datetimes: DatetimeParser,
}

impl ResponseParser {
    pub fn new(datetimes: DatetimeParser) -> Self {
        Self { datetimes }
    }

    pub fn with_fallback_formats(formats: &[String]) -> Self {
        Self::new(DatetimeParser::new(formats.iter().cloned()))
    }

    /// Parse every record of a batch payload
    pub fn parse(&self, raw: &RawResponse) -> ParsedBatch {
        let outcomes: Vec<RecordOutcome> = raw
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| self.parse_record(&raw.batch_name, index, record))
            .collect();

        let parsed = ParsedBatch {
            batch_name: raw.batch_name.clone(),
            outcomes,
        };

        info!(
            batch = %raw.batch_name,
            records = raw.records.len(),
            parsed = parsed.parsed_count(),
            degraded = parsed.degraded_count(),
            failed = parsed.failed_count(),
            "Parsed batch response"
        );

        parsed
    }

    /// Parse one per-shipment record
    pub fn parse_record(&self, batch_name: &str, index: usize, record: &RawRecord) -> RecordOutcome {
        let Some(tracking_id) = text_field(record, fields::TRACKING_ID) else {
            let message = text_field(record, fields::MESSAGE);
            warn!(
                batch = batch_name,
                index,
                upstream_message = message.as_deref().unwrap_or(""),
                "Shipment record has no tracking identifier, skipping"
            );
            return RecordOutcome::Failed(TrackError::parse_field(
                format!("{}#{}", batch_name, index),
                fields::TRACKING_ID,
            ));
        };

        let Some(status) = text_field(record, fields::PARCEL_STATUS) else {
            let message = text_field(record, fields::MESSAGE)
                .unwrap_or_else(|| "no status returned".to_string());
            let reason = TrackError::parse_field(&tracking_id, fields::PARCEL_STATUS).to_string();
            warn!(
                batch = batch_name,
                tracking_id = %tracking_id,
                upstream_message = %message,
                "Shipment record has no status"
            );

            let event = self.summary_event(
                &tracking_id,
                format!("{}{}", UPSTREAM_STATUS_PREFIX, message),
                record,
                EventNote::UpstreamError,
            );
            return RecordOutcome::Degraded(group(&tracking_id, batch_name, vec![event]), reason);
        };

        match record.get(fields::EVENT_SCANS) {
            Some(Value::Array(scans)) if !scans.is_empty() => {
                let events = scans
                    .iter()
                    .enumerate()
                    .map(|(position, scan)| {
                        self.scan_event(&tracking_id, &status, record, position, scan)
                    })
                    .collect();
                RecordOutcome::Parsed(group(&tracking_id, batch_name, events))
            },
            _ => {
                debug!(batch = batch_name, tracking_id = %tracking_id, "No event scans found");
                let event = self.summary_event(&tracking_id, status, record, EventNote::NoScanData);
                RecordOutcome::Degraded(
                    group(&tracking_id, batch_name, vec![event]),
                    EventNote::NoScanData.to_string(),
                )
            },
        }
    }

    fn scan_event(
        &self,
        tracking_id: &str,
        status: &str,
        record: &RawRecord,
        position: usize,
        scan: &Value,
    ) -> ShipmentEvent {
        let mut details = match scan {
            Value::Object(map) => map.clone(),
            _ => RawRecord::new(),
        };

        let raw_timestamp = details.remove(fields::DATETIME);
        let timestamp = raw_timestamp
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|raw| self.datetimes.parse(raw));

        if timestamp.is_none() {
            debug!(
                tracking_id,
                position,
                raw = ?raw_timestamp,
                "Scan timestamp missing or unrecognised"
            );
        }

        let origin = take_text(&mut details, fields::ORIGIN)
            .or_else(|| text_field(record, fields::ORIGIN));
        let destination = take_text(&mut details, fields::DESTINATION)
            .or_else(|| text_field(record, fields::DESTINATION));

        ShipmentEvent {
            tracking_id: tracking_id.to_string(),
            status: status.to_string(),
            timestamp,
            origin,
            destination,
            sequence: position as u32,
            note: timestamp.is_none().then_some(EventNote::UnparsedTimestamp),
            details,
        }
    }

    fn summary_event(
        &self,
        tracking_id: &str,
        status: String,
        record: &RawRecord,
        note: EventNote,
    ) -> ShipmentEvent {
        ShipmentEvent {
            tracking_id: tracking_id.to_string(),
            status,
            timestamp: None,
            origin: text_field(record, fields::ORIGIN),
            destination: text_field(record, fields::DESTINATION),
            sequence: 0,
            note: Some(note),
            details: RawRecord::new(),
        }
    }
}

fn group(tracking_id: &str, batch_name: &str, events: Vec<ShipmentEvent>) -> ShipmentEvents {
    ShipmentEvents {
        tracking_id: tracking_id.to_string(),
        batch_name: batch_name.to_string(),
        events,
    }
}

/// Non-blank string (or number) field as text
fn text_field(record: &RawRecord, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn take_text(record: &mut RawRecord, key: &str) -> Option<String> {
    let text = text_field(record, key);
    if text.is_some() {
        record.remove(key);
    }
    text
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_single_scan_is_parsed() {
        let parser = ResponseParser::default();
        let outcome = parser.parse_record(
            "b1",
            0,
            &record(json!({
                "Tracking_ID": "T1",
                "Parcel_Status": "Delivered",
                "Event_Scans": [{"Datetime": "2024-01-01T10:00:00"}]
            })),
        );

        let RecordOutcome::Parsed(group) = outcome else {
            panic!("expected a fully parsed record");
        };
        assert_eq!(group.tracking_id, "T1");
        assert_eq!(group.events.len(), 1);
        let event = &group.events[0];
        assert_eq!(event.tracking_id, "T1");
        assert_eq!(event.status, "Delivered");
        assert_eq!(event.timestamp, Some(at(2024, 1, 1, 10, 0, 0)));
        assert_eq!(event.note, None);
    }

    #[test]
    fn test_missing_scans_yield_one_degraded_event() {
        let parser = ResponseParser::default();
        let outcome = parser.parse_record(
            "b1",
            0,
            &record(json!({"Tracking_ID": "T1", "Parcel_Status": "Delivered"})),
        );

        let RecordOutcome::Degraded(group, reason) = outcome else {
            panic!("expected a degraded record");
        };
        assert_eq!(reason, "no scan data");
        assert_eq!(group.events.len(), 1);
        assert_eq!(group.events[0].status, "Delivered");
        assert_eq!(group.events[0].note, Some(EventNote::NoScanData));
        assert_eq!(group.events[0].timestamp, None);
    }

    #[test]
    fn test_missing_status_carries_upstream_message() {
        let parser = ResponseParser::default();
        let outcome = parser.parse_record(
            "b1",
            3,
            &record(json!({"Tracking_ID": "T9", "Message": "Tracking number not found"})),
        );

        let RecordOutcome::Degraded(group, reason) = outcome else {
            panic!("expected a degraded record");
        };
        assert!(reason.contains("Parcel_Status"));
        assert_eq!(group.events[0].status, "API Response: Tracking number not found");
        assert_eq!(group.events[0].note, Some(EventNote::UpstreamError));
    }

    #[test]
    fn test_missing_identifier_fails_only_that_record() {
        let parser = ResponseParser::default();
        let raw = RawResponse::new(
            "b2",
            vec![
                record(json!({"Message": "Internal error"})),
                record(json!({"Tracking_ID": "T2", "Parcel_Status": "In Transit",
                              "Event_Scans": [{"Datetime": "2024-03-05 08:30:00"}]})),
            ],
        );

        let parsed = parser.parse(&raw);
        assert_eq!(parsed.failed_count(), 1);
        assert_eq!(parsed.parsed_count(), 1);
        assert!(matches!(
            parsed.outcomes[0],
            RecordOutcome::Failed(TrackError::ParseField { .. })
        ));
        let ids: Vec<_> = parsed.events().map(|g| g.tracking_id.as_str()).collect();
        assert_eq!(ids, vec!["T2"]);
    }

    #[test]
    fn test_scans_keep_payload_order_and_fields() {
        let parser = ResponseParser::default();
        let outcome = parser.parse_record(
            "b1",
            0,
            &record(json!({
                "Tracking_ID": 9400111,
                "Parcel_Status": "Delivered",
                "Origin": "10001",
                "Event_Scans": [
                    {"Datetime": "2024-01-03T09:00:00Z", "Description": "Delivered", "Destination": "94105"},
                    {"Datetime": "01/02/2024 17:45", "Description": "Out for delivery"},
                    {"Description": "Label created"}
                ]
            })),
        );

        let group = outcome.into_events().unwrap();
        assert_eq!(group.tracking_id, "9400111");
        let sequences: Vec<u32> = group.events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);

        assert_eq!(group.events[0].timestamp, Some(at(2024, 1, 3, 9, 0, 0)));
        assert_eq!(group.events[0].destination.as_deref(), Some("94105"));
        assert_eq!(group.events[0].origin.as_deref(), Some("10001"));
        assert_eq!(group.events[0].details["Description"], "Delivered");
        assert!(!group.events[0].details.contains_key("Datetime"));

        assert_eq!(group.events[1].timestamp, Some(at(2024, 1, 2, 17, 45, 0)));
        assert_eq!(group.events[2].timestamp, None);
        assert_eq!(group.events[2].note, Some(EventNote::UnparsedTimestamp));
    }

    #[test]
    fn test_datetime_fallbacks() {
        let parser = DatetimeParser::default();
        assert_eq!(
            parser.parse("2024-01-01T10:00:00.123-05:00"),
            Some(at(2024, 1, 1, 10, 0, 0))
        );
        assert_eq!(parser.parse("2024-01-01 10:00:00"), Some(at(2024, 1, 1, 10, 0, 0)));
        assert_eq!(parser.parse("2024-01-01T10:00"), Some(at(2024, 1, 1, 10, 0, 0)));
        assert_eq!(
            parser.parse("Tue, 2 Jan 2024 08:15:00 +0000"),
            Some(at(2024, 1, 2, 8, 15, 0))
        );
        assert_eq!(parser.parse("03/15/2024 02:30 PM"), Some(at(2024, 3, 15, 14, 30, 0)));
        assert_eq!(parser.parse("2024-03-15"), Some(at(2024, 3, 15, 0, 0, 0)));
        assert_eq!(parser.parse("yesterday"), None);
        assert_eq!(parser.parse("T"), None);
    }

    #[test]
    fn test_custom_fallback_formats() {
        let parser = DatetimeParser::new(["%d.%m.%Y %H:%M"]);
        assert_eq!(parser.parse("15.03.2024 14:30"), Some(at(2024, 3, 15, 14, 30, 0)));
        assert_eq!(parser.parse("2024-03-15 14:30:00"), None);
    }
}
