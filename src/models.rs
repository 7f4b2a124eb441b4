//! Core Data Models
//!
//! Wire types for the organization usage and costs API, and the normalized
//! records the rest of the exporter works with.
//!
//! ## Data Flow
//!
//! 1. **Wire**: [`Page`] of [`UsageBucket`] / [`CostBucket`] as returned upstream
//! 2. **Normalization**: [`UsageRecord::from_result`] resolves nulls and the
//!    string-or-bool `batch` field into plain string dimensions
//! 3. **Accounting**: one [`Measure`] per record feeds its own ledger series
//!
//! Nothing past this module sees an `Option` dimension or a [`BatchField`].

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Placeholder used for any dimension the API left null.
pub const UNKNOWN: &str = "unknown";

/// Usage endpoints polled by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Completions,
    Embeddings,
    Moderations,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [
        ResourceType::Completions,
        ResourceType::Embeddings,
        ResourceType::Moderations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Completions => "completions",
            ResourceType::Embeddings => "embeddings",
            ResourceType::Moderations => "moderations",
        }
    }

    /// Grouping dimensions accepted by this endpoint. Only completions can be
    /// split by the batch flag.
    pub fn group_by(&self) -> &'static [&'static str] {
        match self {
            ResourceType::Completions => &["project_id", "user_id", "api_key_id", "model", "batch"],
            ResourceType::Embeddings | ResourceType::Moderations => {
                &["project_id", "user_id", "api_key_id", "model"]
            }
        }
    }

    /// Sub-measures reported by this endpoint.
    pub fn measures(&self) -> &'static [Measure] {
        match self {
            ResourceType::Completions => &[
                Measure::Input,
                Measure::Output,
                Measure::InputCached,
                Measure::InputAudio,
                Measure::OutputAudio,
                Measure::Requests,
            ],
            ResourceType::Embeddings | ResourceType::Moderations => {
                &[Measure::Input, Measure::Requests]
            }
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| anyhow!("unknown resource type: {s}"))
    }
}

/// One numeric quantity inside a usage result, tracked as its own series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    Input,
    Output,
    InputCached,
    InputAudio,
    OutputAudio,
    Requests,
}

impl Measure {
    /// Value of the `token_type` label (or the ledger key suffix for requests).
    pub fn as_str(&self) -> &'static str {
        match self {
            Measure::Input => "input",
            Measure::Output => "output",
            Measure::InputCached => "input_cached",
            Measure::InputAudio => "input_audio",
            Measure::OutputAudio => "output_audio",
            Measure::Requests => "requests",
        }
    }

    pub fn is_token(&self) -> bool {
        !matches!(self, Measure::Requests)
    }

    fn read(&self, result: &UsageResult) -> Option<u64> {
        match self {
            Measure::Input => result.input_tokens,
            Measure::Output => result.output_tokens,
            Measure::InputCached => result.input_cached_tokens,
            Measure::InputAudio => result.input_audio_tokens,
            Measure::OutputAudio => result.output_audio_tokens,
            Measure::Requests => result.num_model_requests,
        }
    }
}

/// A paginated list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub object: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageBucket {
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub results: Vec<UsageResult>,
}

/// `batch` arrives as a bool on some revisions of the API and as a string on
/// others; anything else is a decode error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchField {
    Flag(bool),
    Label(String),
}

impl BatchField {
    pub fn canonical(field: Option<&BatchField>) -> String {
        match field {
            Some(BatchField::Flag(true)) => "true".to_string(),
            Some(BatchField::Flag(false)) => "false".to_string(),
            Some(BatchField::Label(label)) => label.clone(),
            None => UNKNOWN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageResult {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub input_cached_tokens: Option<u64>,
    #[serde(default)]
    pub input_audio_tokens: Option<u64>,
    #[serde(default)]
    pub output_audio_tokens: Option<u64>,
    #[serde(default)]
    pub num_model_requests: Option<u64>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub batch: Option<BatchField>,
}

/// Null dimensions become [`UNKNOWN`]; present values, even empty ones, are kept.
pub fn dimension(value: Option<&str>) -> String {
    value.unwrap_or(UNKNOWN).to_string()
}

/// Half-open `[start, end)` bucket interval in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketSpan {
    pub start: i64,
    pub end: i64,
}

impl BucketSpan {
    /// A bucket is closed once its end is at or before `now`.
    pub fn is_closed(&self, now: i64) -> bool {
        self.end <= now
    }
}

/// A normalized usage observation.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub operation: ResourceType,
    pub bucket: BucketSpan,
    pub model: String,
    pub project_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub batch: String,
    pub measures: Vec<(Measure, f64)>,
}

impl UsageRecord {
    pub fn from_result(operation: ResourceType, bucket: BucketSpan, result: &UsageResult) -> Self {
        let measures = operation
            .measures()
            .iter()
            .map(|m| (*m, m.read(result).unwrap_or(0) as f64))
            .collect();

        Self {
            operation,
            bucket,
            model: dimension(result.model.as_deref()),
            project_id: dimension(result.project_id.as_deref()),
            user_id: dimension(result.user_id.as_deref()),
            api_key_id: dimension(result.api_key_id.as_deref()),
            batch: BatchField::canonical(result.batch.as_ref()),
            measures,
        }
    }
}

impl UsageBucket {
    pub fn span(&self) -> BucketSpan {
        BucketSpan {
            start: self.start_time,
            end: self.end_time,
        }
    }

    pub fn records(&self, operation: ResourceType) -> impl Iterator<Item = UsageRecord> + '_ {
        let span = self.span();
        self.results
            .iter()
            .map(move |r| UsageRecord::from_result(operation, span, r))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBucket {
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub results: Vec<CostResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAmount {
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostResult {
    #[serde(default)]
    pub amount: Option<CostAmount>,
    #[serde(default)]
    pub line_item: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}
