use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder returned when no pod name contains the requested fragment.
pub const POD_NAME_NOT_FOUND: &str = "pod_name_not_found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    Other(String),
}

impl PodStatus {
    pub fn parse(token: &str) -> Self {
        match token {
            "Pending" => PodStatus::Pending,
            "Running" => PodStatus::Running,
            "Succeeded" | "Completed" => PodStatus::Succeeded,
            "Failed" | "Error" => PodStatus::Failed,
            "Unknown" | "" => PodStatus::Unknown,
            other => PodStatus::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PodStatus::Running)
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodStatus::Pending => f.write_str("Pending"),
            PodStatus::Running => f.write_str("Running"),
            PodStatus::Succeeded => f.write_str("Succeeded"),
            PodStatus::Failed => f.write_str("Failed"),
            PodStatus::Unknown => f.write_str("Unknown"),
            PodStatus::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEntry {
    pub name: String,
    pub status: PodStatus,
}

/// Point-in-time listing of the pods in one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStatusSnapshot {
    pub pods: Vec<PodEntry>,
}

impl PodStatusSnapshot {
    pub fn new(pods: Vec<PodEntry>) -> Self {
        Self { pods }
    }

    /// Parse the tabular output of `kubectl get pods`.
    ///
    /// The `NAME READY STATUS ...` header row is skipped when present. The
    /// status is the third column; rows too short to carry one are kept with
    /// an `Unknown` status so they count as not running.
    pub fn parse_listing(text: &str) -> Self {
        let pods = text
            .lines()
            .map(str::split_whitespace)
            .map(|cols| cols.collect::<Vec<_>>())
            .filter(|cols| !cols.is_empty())
            .enumerate()
            .filter(|(i, cols)| !(*i == 0 && cols[0] == "NAME"))
            .map(|(_, cols)| PodEntry {
                name: cols[0].to_string(),
                status: cols
                    .get(2)
                    .map(|s| PodStatus::parse(s))
                    .unwrap_or(PodStatus::Unknown),
            })
            .collect();
        Self { pods }
    }

    pub fn total(&self) -> usize {
        self.pods.len()
    }

    pub fn running(&self) -> usize {
        self.pods.iter().filter(|p| p.status.is_running()).count()
    }

    pub fn not_running(&self) -> impl Iterator<Item = &PodEntry> {
        self.pods.iter().filter(|p| !p.status.is_running())
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn all_running(&self) -> bool {
        self.running() == self.total()
    }
}

#[derive(Debug, Clone)]
pub struct PollResult {
    pub ready: bool,
    pub attempts_used: u32,
    pub last_snapshot: PodStatusSnapshot,
}

/// A raw line read straight from a pod's log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLogLine(pub String);

impl SourceLogLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceLogLine {
    fn from(s: &str) -> Self {
        SourceLogLine(s.to_string())
    }
}

impl From<String> for SourceLogLine {
    fn from(s: String) -> Self {
        SourceLogLine(s)
    }
}

/// One record returned by the search backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "BTreeMap<String, serde_json::Value>")]
pub struct BackendEvent {
    pub raw: String,
    pub index: String,
    pub sourcetype: String,
    pub source: String,
    pub fields: BTreeMap<String, String>,
}

impl BackendEvent {
    #[cfg(test)]
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Default::default()
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "index" => Some(&self.index),
            "sourcetype" => Some(&self.sourcetype),
            "source" => Some(&self.source),
            "_raw" => Some(&self.raw),
            _ => self.fields.get(key).map(String::as_str),
        }
    }
}

fn json_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(json_to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        serde_json::Value::Null | serde_json::Value::Object(_) => None,
    }
}

impl From<BTreeMap<String, serde_json::Value>> for BackendEvent {
    fn from(row: BTreeMap<String, serde_json::Value>) -> Self {
        let mut event = BackendEvent::default();
        for (key, value) in row {
            let Some(value) = json_to_string(value) else {
                continue;
            };
            match key.as_str() {
                "_raw" => event.raw = value,
                "index" => event.index = value,
                "sourcetype" => event.sourcetype = value,
                "source" => event.source = value,
                _ => {
                    event.fields.insert(key, value);
                }
            }
        }
        event
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Splunk time modifiers bounding a search.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeRange {
    #[serde(default = "default_earliest")]
    pub earliest: String,
    #[serde(default = "default_latest")]
    pub latest: String,
}

fn default_earliest() -> String {
    "-5m@m".to_string()
}

fn default_latest() -> String {
    "now".to_string()
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            earliest: default_earliest(),
            latest: default_latest(),
        }
    }
}

impl TimeRange {
    pub fn new(earliest: impl Into<String>, latest: impl Into<String>) -> Self {
        Self {
            earliest: earliest.into(),
            latest: latest.into(),
        }
    }

    pub fn since(earliest: impl Into<String>) -> Self {
        Self::new(earliest, default_latest())
    }
}

/// A search passed verbatim to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub query: String,
    pub range: TimeRange,
}

impl SearchFilter {
    pub fn raw(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            range: TimeRange::default(),
        }
    }

    /// Start an event search against `index`.
    pub fn events(index: &str) -> Self {
        Self::raw(format!("search index={}", index))
    }

    /// Start a metric preview against `index`.
    pub fn metrics_preview(index: &str) -> Self {
        Self::raw(format!("| mpreview index={}", index))
    }

    /// Search-time predicate, `key=value`.
    pub fn term(mut self, key: &str, value: &str) -> Self {
        self.query.push_str(&format!(" {}={}", key, value));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.query.push(' ');
        self.query.push_str(text);
        self
    }

    pub fn within(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }
}

impl fmt::Display for SearchFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} .. {}]",
            self.query, self.range.earliest, self.range.latest
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub matched: usize,
    pub total_events: usize,
    /// `raw` text of events with no matching source line.
    pub unmatched: Vec<String>,
    pub metadata_mismatches: Vec<String>,
}

impl ReconcileResult {
    pub fn is_consistent(&self) -> bool {
        self.matched == self.total_events && self.metadata_mismatches.is_empty()
    }
}
