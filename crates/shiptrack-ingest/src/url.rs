//! Target URL construction for a partner endpoint

use crate::batch::Batch;
use crate::config::PipelineConfig;
use crate::models::TargetRequest;
use shiptrack_common::{Result, TrackError};

/// Placeholder replaced by the joined identifiers
pub const IDS_PLACEHOLDER: &str = "{ids}";

/// Builds partner request URLs from batches.
///
/// With `{ids}` in the template the encoded, joined identifiers are
/// substituted there; otherwise they are appended to the template.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    template: String,
    separator: String,
    ids_per_request: Option<usize>,
}

impl UrlBuilder {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            separator: ",".to_string(),
            ids_per_request: None,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.url_template.clone())
            .with_separator(config.id_separator.clone())
            .with_ids_per_request(config.ids_per_request)
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Split a batch across several URLs of at most `limit` identifiers.
    /// `None` or `Some(0)` keeps the whole batch in one URL.
    pub fn with_ids_per_request(mut self, limit: Option<usize>) -> Self {
        self.ids_per_request = limit.filter(|n| *n > 0);
        self
    }

    /// Build the URLs for an ordered identifier sequence.
    ///
    /// Every identifier lands in exactly one URL, in input order.
    pub fn urls_for(&self, tracking_ids: &[String]) -> Result<Vec<String>> {
        if tracking_ids.is_empty() {
            return Err(TrackError::InvalidBatch(
                "tracking identifier sequence is empty".to_string(),
            ));
        }

        let chunk_size = self.ids_per_request.unwrap_or(tracking_ids.len());
        Ok(tracking_ids
            .chunks(chunk_size)
            .map(|chunk| self.render(chunk))
            .collect())
    }

    /// Build the target requests for a batch
    pub fn requests_for(&self, batch: &Batch) -> Result<Vec<TargetRequest>> {
        if batch.is_empty() {
            return Err(TrackError::InvalidBatch(format!(
                "batch '{}' has no tracking identifiers",
                batch.name()
            )));
        }

        let chunk_size = self.ids_per_request.unwrap_or(batch.len());
        Ok(batch
            .tracking_ids()
            .chunks(chunk_size)
            .map(|chunk| TargetRequest {
                batch_name: batch.name().to_string(),
                url: self.render(chunk),
                tracking_ids: chunk.to_vec(),
            })
            .collect())
    }

    fn render(&self, chunk: &[String]) -> String {
        let joined = chunk
            .iter()
            .map(|id| urlencoding::encode(id).into_owned())
            .collect::<Vec<_>>()
            .join(&self.separator);

        if self.template.contains(IDS_PLACEHOLDER) {
            self.template.replacen(IDS_PLACEHOLDER, &joined, 1)
        } else {
            format!("{}{}", self.template, joined)
        }
    }
}
