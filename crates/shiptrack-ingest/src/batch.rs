//! Batches of tracking identifiers, the unit of work of a run
//!
//! Batches come from an external source (a SQL extract, a reporting export)
//! as a mapping of batch name to identifiers. Names must be unique within a
//! run because both stages address persisted payloads by batch name.

use serde::{Deserialize, Serialize};
use shiptrack_common::{Result, TrackError};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Default CSV column holding tracking identifiers
pub const DEFAULT_CSV_COLUMN: &str = "tracking_number";

/// Default prefix for generated batch names
pub const DEFAULT_BATCH_PREFIX: &str = "batch";

/// Named group of tracking identifiers processed together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    name: String,
    tracking_ids: Vec<String>,
}

impl Batch {
    /// Build a batch, trimming identifiers and dropping blank ones.
    ///
    /// An empty batch is representable; it is rejected when the fetch stage
    /// builds its URLs, so only that batch fails.
    pub fn new<I, S>(name: impl Into<String>, tracking_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tracking_ids = tracking_ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        Self {
            name: name.into(),
            tracking_ids,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracking_ids(&self) -> &[String] {
        &self.tracking_ids
    }

    pub fn len(&self) -> usize {
        self.tracking_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracking_ids.is_empty()
    }
}

/// Name of a batch whose raw response is persisted; the parse-stage task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchName(pub String);

impl BatchName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// All batches of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSet {
    batches: Vec<Batch>,
}

impl BatchSet {
    /// Collect batches, rejecting blank or duplicate names
    pub fn new(batches: Vec<Batch>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(batches.len());
        for batch in &batches {
            if batch.name.trim().is_empty() {
                return Err(TrackError::InvalidBatch("batch name is blank".to_string()));
            }
            if !seen.insert(batch.name.as_str()) {
                return Err(TrackError::InvalidBatch(format!(
                    "duplicate batch name '{}'",
                    batch.name
                )));
            }
        }
        Ok(Self { batches })
    }

    pub fn from_map(map: BTreeMap<String, Vec<String>>) -> Result<Self> {
        Self::new(
            map.into_iter()
                .map(|(name, ids)| Batch::new(name, ids))
                .collect(),
        )
    }

    /// Split a flat identifier list into batches of at most `batch_size`,
    /// named `<prefix>_0001`, `<prefix>_0002`, ...
    pub fn chunked<I, S>(prefix: &str, tracking_ids: I, batch_size: usize) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if batch_size == 0 {
            return Err(TrackError::InvalidBatch(
                "batch size must be greater than 0".to_string(),
            ));
        }

        let cleaned = Batch::new(prefix, tracking_ids).tracking_ids;
        let batches = cleaned
            .chunks(batch_size)
            .enumerate()
            .map(|(index, chunk)| Batch::new(format!("{}_{:04}", prefix, index + 1), chunk))
            .collect();

        Self::new(batches)
    }

    /// Load `{ "<batch name>": ["id", ...], ... }`
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let map: BTreeMap<String, Vec<String>> = serde_json::from_str(&content)?;
        let set = Self::from_map(map)?;

        info!(
            path = %path.display(),
            batches = set.len(),
            identifiers = set.total_ids(),
            "Loaded batches from JSON"
        );
        Ok(set)
    }

    /// Load identifiers from one CSV column and split them into batches
    pub fn from_csv_file(
        path: impl AsRef<Path>,
        column: &str,
        prefix: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path).map_err(std::io::Error::from)?;

        let headers = reader.headers().map_err(std::io::Error::from)?.clone();
        let index = headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(column))
            .ok_or_else(|| {
                TrackError::InvalidBatch(format!(
                    "column '{}' not found in {}",
                    column,
                    path.display()
                ))
            })?;

        let mut ids = Vec::new();
        for row in reader.records() {
            let row = row.map_err(std::io::Error::from)?;
            if let Some(value) = row.get(index) {
                ids.push(value.to_string());
            }
        }
        debug!(path = %path.display(), rows = ids.len(), "Read identifiers from CSV");

        let set = Self::chunked(prefix, ids, batch_size)?;
        info!(
            path = %path.display(),
            batches = set.len(),
            identifiers = set.total_ids(),
            "Loaded batches from CSV"
        );
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn total_ids(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Batch> {
        self.batches.iter()
    }

    pub fn names(&self) -> Vec<BatchName> {
        self.batches.iter().map(|b| BatchName(b.name.clone())).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Batch> {
        self.batches.iter().find(|b| b.name == name)
    }

    pub fn into_vec(self) -> Vec<Batch> {
        self.batches
    }
}

impl IntoIterator for BatchSet {
    type Item = Batch;
    type IntoIter = std::vec::IntoIter<Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.into_iter()
    }
}
