//! Records that flow between the pipeline stages

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One per-identifier object exactly as the partner returned it
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Partner payload field names
pub mod fields {
    pub const TRACKING_ID: &str = "Tracking_ID";
    pub const PARCEL_STATUS: &str = "Parcel_Status";
    pub const EVENT_SCANS: &str = "Event_Scans";
    pub const DATETIME: &str = "Datetime";
    pub const MESSAGE: &str = "Message";
    pub const ORIGIN: &str = "Origin";
    pub const DESTINATION: &str = "Destination";
}

/// A fully formed outbound request for (part of) a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRequest {
    pub batch_name: String,
    pub url: String,
    /// Identifiers embedded in `url`, in input order
    pub tracking_ids: Vec<String>,
}

/// Unparsed API payload for one batch, as persisted by the fetch stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    pub batch_name: String,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<RawRecord>,
}

impl RawResponse {
    pub fn new(batch_name: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            batch_name: batch_name.into(),
            fetched_at: Utc::now(),
            records,
        }
    }
}

/// Why an event carries less than a full scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventNote {
    /// The shipment had no `Event_Scans`; the event only carries its status
    NoScanData,
    /// Identifier or status could not be read; status holds the upstream message
    UpstreamError,
    /// The scan's `Datetime` was missing or matched no known format
    UnparsedTimestamp,
}

impl std::fmt::Display for EventNote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventNote::NoScanData => write!(f, "no scan data"),
            EventNote::UpstreamError => write!(f, "upstream error"),
            EventNote::UnparsedTimestamp => write!(f, "unparsed timestamp"),
        }
    }
}

/// One structured status row for one tracking identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentEvent {
    pub tracking_id: String,
    pub status: String,
    pub timestamp: Option<NaiveDateTime>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    /// Position of the scan within the shipment's `Event_Scans`
    pub sequence: u32,
    pub note: Option<EventNote>,
    /// Remaining scan fields, kept verbatim for reporting
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: RawRecord,
}

/// All events of one shipment; the unit persisted by the parse stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentEvents {
    pub tracking_id: String,
    pub batch_name: String,
    pub events: Vec<ShipmentEvent>,
}
