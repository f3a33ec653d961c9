//! Splunk management-port client used to query ingested telemetry.
//!
//! Searches run as asynchronous jobs: the query is posted, the job status is
//! polled until `isDone`, then the events (or transformed results) are read
//! back in one page.

use crate::error::BackendError;
use crate::types::{BackendEvent, MetricPoint, SearchFilter, TimeRange};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Event,
    Metric,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Event => f.write_str("event"),
            IndexKind::Metric => f.write_str("metric"),
        }
    }
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Events matching `filter`; an empty result is not an error.
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<BackendEvent>, BackendError>;

    async fn search_metrics(
        &self,
        index: &str,
        metric_name: &str,
        range: &TimeRange,
    ) -> Result<Vec<MetricPoint>, BackendError>;

    async fn create_index(&self, name: &str, kind: IndexKind) -> Result<(), BackendError>;

    async fn delete_index(&self, name: &str) -> Result<(), BackendError>;
}

#[derive(Deserialize)]
struct JobCreated {
    sid: String,
}

#[derive(Deserialize)]
struct JobStatus {
    entry: Vec<JobEntry>,
}

#[derive(Deserialize)]
struct JobEntry {
    content: JobContent,
}

#[derive(Deserialize)]
struct JobContent {
    #[serde(rename = "isDone")]
    is_done: bool,
    #[serde(rename = "dispatchState", default)]
    dispatch_state: Option<String>,
}

#[derive(Deserialize)]
struct SearchResults<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// Which job endpoint holds the output: raw events, or the rows of a
/// transforming search such as `mstats`.
#[derive(Clone, Copy)]
enum Output {
    Events,
    Results,
}

impl Output {
    fn path(self) -> &'static str {
        match self {
            Output::Events => "events",
            Output::Results => "results",
        }
    }
}

/// Queries without a generating command are plain searches.
pub fn normalize_query(query: &str) -> String {
    let q = query.trim();
    if q.starts_with("search ") || q.starts_with('|') {
        q.to_string()
    } else {
        format!("search {}", q)
    }
}

pub fn metric_query(index: &str, metric_name: &str) -> String {
    format!(
        "| mstats latest(_value) AS _value WHERE index={} AND metric_name=\"{}\" span=10s",
        index, metric_name
    )
}

pub struct SplunkClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    job_polls: u32,
    job_poll_interval: Duration,
}

impl SplunkClient {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        // Test instances run with self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
            job_polls: 20,
            job_poll_interval: Duration::from_secs(1),
        })
    }

    pub fn with_job_polling(mut self, polls: u32, interval: Duration) -> Self {
        self.job_polls = polls.max(1);
        self.job_poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                code: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn run_job<T: DeserializeOwned>(
        &self,
        query: &str,
        range: &TimeRange,
        output: Output,
    ) -> Result<Vec<T>, BackendError> {
        let query = normalize_query(query);
        info!("Search query: {}", query);
        let resp = self
            .client
            .post(self.url("/services/search/jobs?output_mode=json"))
            .basic_auth(&self.user, Some(&self.password))
            .form(&[
                ("search", query.as_str()),
                ("earliest_time", range.earliest.as_str()),
                ("latest_time", range.latest.as_str()),
            ])
            .send()
            .await?;
        let JobCreated { sid } = Self::decode(resp).await?;
        debug!("Search job {} created", sid);

        self.wait_for_job(&sid).await?;

        let resp = self
            .client
            .get(self.url(&format!(
                "/services/search/jobs/{}/{}?output_mode=json&count=0",
                sid,
                output.path()
            )))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        let SearchResults { results } = Self::decode(resp).await?;
        debug!("Search job {} returned {} rows", sid, results.len());
        Ok(results)
    }

    async fn wait_for_job(&self, sid: &str) -> Result<(), BackendError> {
        for poll in 1..=self.job_polls {
            let resp = self
                .client
                .get(self.url(&format!("/services/search/jobs/{}?output_mode=json", sid)))
                .basic_auth(&self.user, Some(&self.password))
                .send()
                .await?;
            let status: JobStatus = Self::decode(resp).await?;
            let content = status
                .entry
                .into_iter()
                .next()
                .map(|e| e.content)
                .ok_or_else(|| BackendError::Malformed(format!("job {} has no entry", sid)))?;
            debug!(
                "Search job {} isDone={} state={}",
                sid,
                content.is_done,
                content.dispatch_state.as_deref().unwrap_or("?")
            );
            if content.is_done {
                return Ok(());
            }
            if content.dispatch_state.as_deref() == Some("FAILED") {
                return Err(BackendError::Malformed(format!("search job {} failed", sid)));
            }
            if poll < self.job_polls {
                tokio::time::sleep(self.job_poll_interval).await;
            }
        }
        Err(BackendError::SearchTimeout {
            sid: sid.to_string(),
            polls: self.job_polls,
        })
    }
}

fn metric_point(
    name: &str,
    row: BTreeMap<String, serde_json::Value>,
) -> Result<Option<MetricPoint>, BackendError> {
    let value = match row.get("_value") {
        Some(serde_json::Value::String(s)) => s.parse::<f64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    // mstats emits empty buckets without a value
    let Some(value) = value else {
        return Ok(None);
    };
    let time = row
        .get("_time")
        .and_then(|t| t.as_str())
        .ok_or_else(|| BackendError::Malformed(format!("metric row for {} has no _time", name)))?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(time)
        .map_err(|e| BackendError::Malformed(format!("bad _time {:?}: {}", time, e)))?
        .with_timezone(&chrono::Utc);
    Ok(Some(MetricPoint {
        name: name.to_string(),
        value,
        timestamp,
    }))
}

#[async_trait]
impl SearchBackend for SplunkClient {
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<BackendEvent>, BackendError> {
        self.run_job(&filter.query, &filter.range, Output::Events)
            .await
    }

    async fn search_metrics(
        &self,
        index: &str,
        metric_name: &str,
        range: &TimeRange,
    ) -> Result<Vec<MetricPoint>, BackendError> {
        let rows: Vec<BTreeMap<String, serde_json::Value>> = self
            .run_job(&metric_query(index, metric_name), range, Output::Results)
            .await?;
        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(point) = metric_point(metric_name, row)? {
                points.push(point);
            }
        }
        Ok(points)
    }

    async fn create_index(&self, name: &str, kind: IndexKind) -> Result<(), BackendError> {
        let datatype = kind.to_string();
        let resp = self
            .client
            .post(self.url("/services/data/indexes?output_mode=json"))
            .basic_auth(&self.user, Some(&self.password))
            .form(&[("name", name), ("datatype", datatype.as_str())])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            info!("Index {} already exists", name);
            return Ok(());
        }
        let _: serde_json::Value = Self::decode(resp).await?;
        info!("Created {} index {}", kind, name);
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<(), BackendError> {
        let resp = self
            .client
            .delete(self.url(&format!("/services/data/indexes/{}?output_mode=json", name)))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            info!("Index {} does not exist", name);
            return Ok(());
        }
        let _: serde_json::Value = Self::decode(resp).await?;
        info!("Deleted index {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SID: &str = "1714557600.42";

    fn client(server: &MockServer) -> SplunkClient {
        SplunkClient::new(server.uri(), "admin", "password", Duration::from_secs(5))
            .unwrap()
            .with_job_polling(3, Duration::from_millis(10))
    }

    fn job_status(done: bool) -> serde_json::Value {
        json!({ "entry": [ { "content": { "isDone": done, "dispatchState": if done { "DONE" } else { "RUNNING" } } } ] })
    }

    async fn mount_job(server: &MockServer, output: &str, rows: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/services/search/jobs"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sid": SID })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/services/search/jobs/{}", SID)))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_status(false)))
            .up_to_n_times(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/services/search/jobs/{}", SID)))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_status(true)))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/services/search/jobs/{}/{}", SID, output)))
            .and(query_param("count", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": rows })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("index=main"), "search index=main");
        assert_eq!(normalize_query("search index=main"), "search index=main");
        assert_eq!(
            normalize_query(" | mpreview index=test_metrics"),
            "| mpreview index=test_metrics"
        );
    }

    #[tokio::test]
    async fn test_search_returns_events() {
        let server = MockServer::start().await;
        mount_job(
            &server,
            "events",
            json!([
                {
                    "_raw": "2024-05-01T10:00:00.000Z info service started",
                    "index": "main",
                    "sourcetype": "kube:container:otel-collector",
                    "source": "/var/log/pods/default_agent-1_abc/otel-collector/0.log",
                    "k8s.pod.name": "agent-1",
                    "k8s.pod.labels.app": ["a", "b"]
                }
            ]),
        )
        .await;

        let filter = SearchFilter::events("main").term("k8s.pod.name", "agent-1");
        let events = client(&server).search(&filter).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw, "2024-05-01T10:00:00.000Z info service started");
        assert_eq!(events[0].sourcetype, "kube:container:otel-collector");
        assert_eq!(events[0].field("k8s.pod.name"), Some("agent-1"));
        assert_eq!(events[0].field("k8s.pod.labels.app"), Some("a,b"));
    }

    #[tokio::test]
    async fn test_search_sends_time_range() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/search/jobs"))
            .and(body_string_contains("earliest_time=-1h%40h"))
            .and(body_string_contains("latest_time=now"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sid": SID })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/services/search/jobs/{}", SID)))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_status(true)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/services/search/jobs/{}/events", SID)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .mount(&server)
            .await;

        let filter = SearchFilter::events("ci_events")
            .term("kind", "pod")
            .within(TimeRange::since("-1h@h"));
        let events = client(&server).search(&filter).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_job_never_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/search/jobs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sid": SID })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/services/search/jobs/{}", SID)))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_status(false)))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server)
            .search(&SearchFilter::events("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SearchTimeout { polls: 3, .. }));
    }

    #[tokio::test]
    async fn test_auth_failure_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/search/jobs"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let err = client(&server)
            .search(&SearchFilter::events("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { code: 401, .. }));
        assert!(!err.is_unavailable());
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let client = SplunkClient::new(
            "http://127.0.0.1:9",
            "admin",
            "password",
            Duration::from_secs(2),
        )
        .unwrap();
        let err = client
            .search(&SearchFilter::events("main"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_search_metrics() {
        let server = MockServer::start().await;
        mount_job(
            &server,
            "results",
            json!([
                { "_time": "2024-05-01T10:00:00.000+00:00", "_value": "0.25" },
                { "_time": "2024-05-01T10:00:10.000+00:00" },
                { "_time": "2024-05-01T10:00:20.000+00:00", "_value": 3 }
            ]),
        )
        .await;

        let points = client(&server)
            .search_metrics("ci_metrics", "k8s.pod.cpu.utilization", &TimeRange::since("-24h@h"))
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name, "k8s.pod.cpu.utilization");
        assert_eq!(points[0].value, 0.25);
        assert_eq!(points[1].value, 3.0);
        assert!(points[0].timestamp < points[1].timestamp);
    }

    #[tokio::test]
    async fn test_index_management() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/data/indexes"))
            .and(body_string_contains("name=ci_metrics"))
            .and(body_string_contains("datatype=metric"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "entry": [] })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/data/indexes"))
            .and(body_string_contains("name=main"))
            .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/services/data/indexes/pod-anno"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entry": [] })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/services/data/indexes/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let c = client(&server);
        c.create_index("ci_metrics", IndexKind::Metric).await.unwrap();
        c.create_index("main", IndexKind::Event).await.unwrap();
        c.delete_index("pod-anno").await.unwrap();
        c.delete_index("gone").await.unwrap();
    }

    #[test]
    fn test_metric_query() {
        assert_eq!(
            metric_query("ci_metrics", "up"),
            "| mstats latest(_value) AS _value WHERE index=ci_metrics AND metric_name=\"up\" span=10s"
        );
    }
}
