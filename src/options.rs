use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

pub const DEFAULT_BATCH_SIZE: usize = 101;

/// Execution options passed along with a stage sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregationOptions {
    /// Documents handed out per cursor batch.
    pub batch_size: usize,
    /// Fail the aggregation if executing it takes longer than this.
    #[serde(rename = "maxTimeMS")]
    pub max_time_ms: Option<u64>,
    pub allow_disk_use: bool,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_time_ms: None,
            allow_disk_use: false,
        }
    }
}

impl AggregationOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_time_ms(mut self, ms: u64) -> Self {
        self.max_time_ms = Some(ms);
        self
    }
}

/// Parse aggregation options from a JSON request object.
/// Recognizes `batchSize` (≥ 1), `maxTimeMS` and `allowDiskUse`; other keys
/// are ignored and missing ones take their defaults.
pub fn parse_aggregation_options(request: &JsonValue) -> Result<AggregationOptions> {
    if !request.is_object() {
        return Err(Error::InvalidQuery("options must be a JSON object".into()));
    }
    let opts: AggregationOptions = serde_json::from_value(request.clone())
        .map_err(|e| Error::InvalidQuery(format!("invalid aggregation options: {e}")))?;
    if opts.batch_size == 0 {
        return Err(Error::InvalidQuery(
            "batchSize must be a positive integer".into(),
        ));
    }
    Ok(opts)
}
