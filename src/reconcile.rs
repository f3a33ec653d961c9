//! Traces events found in the search backend back to the pod's own log
//! output.

use crate::error::BackendError;
use crate::splunk::SearchBackend;
use crate::types::{BackendEvent, ReconcileResult, SearchFilter, SourceLogLine};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Instrument, Span, debug, info, warn};

#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Compare with surrounding whitespace stripped.
    pub trim: bool,
    /// A source line satisfies at most one event.
    pub exclusive: bool,
    pub metadata: Option<MetadataExpectation>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            trim: true,
            exclusive: true,
            metadata: None,
        }
    }
}

/// Per-event metadata that must accompany every ingested record.
#[derive(Debug, Clone, Default)]
pub struct MetadataExpectation {
    pub sourcetype: Option<String>,
    pub source_pattern: Option<Regex>,
    pub fields: BTreeMap<String, String>,
}

impl MetadataExpectation {
    fn check(&self, event: &BackendEvent) -> Option<String> {
        let mut problems = Vec::new();
        if let Some(expected) = &self.sourcetype
            && &event.sourcetype != expected
        {
            problems.push(format!("sourcetype={} (want {})", event.sourcetype, expected));
        }
        if let Some(pattern) = &self.source_pattern
            && !pattern.is_match(&event.source)
        {
            problems.push(format!("source={} (want /{}/)", event.source, pattern));
        }
        for (key, expected) in &self.fields {
            match event.field(key) {
                Some(actual) if actual == expected => {}
                Some(actual) => problems.push(format!("{}={} (want {})", key, actual, expected)),
                None => problems.push(format!("{} missing", key)),
            }
        }
        if problems.is_empty() {
            None
        } else {
            Some(format!("{:?}: {}", event.raw, problems.join(", ")))
        }
    }
}

/// Expected `source` of a container log collected from the node:
/// `/var/log/pods/<namespace>_<pod>_<uid>/<container>/<n>.log`.
pub fn pod_log_source_pattern(
    namespace: &str,
    pod: &str,
    container: Option<&str>,
) -> Result<Regex, regex::Error> {
    let container = container
        .map(regex::escape)
        .unwrap_or_else(|| "[^/]+".to_string());
    let pattern = format!(
        r"^/var/log/pods/{}_{}_[0-9a-fA-F-]+/{}/\d+\.log$",
        regex::escape(namespace),
        regex::escape(pod),
        container
    );
    Regex::new(&pattern)
}

/// Count how many `events` can be traced back to a line in `lines`.
///
/// Each event takes the first equal line. With `exclusive` set that line is
/// then used up, so duplicated events need duplicated lines.
pub fn reconcile_events(
    events: &[BackendEvent],
    lines: &[SourceLogLine],
    options: &MatchOptions,
) -> ReconcileResult {
    let normalize = |s: &str| -> String {
        if options.trim {
            s.trim().to_string()
        } else {
            s.to_string()
        }
    };
    let candidates: Vec<String> = lines.iter().map(|l| normalize(l.as_str())).collect();
    let mut consumed = vec![false; candidates.len()];
    let mut result = ReconcileResult {
        total_events: events.len(),
        ..Default::default()
    };

    for event in events {
        let raw = normalize(&event.raw);
        let hit = candidates
            .iter()
            .enumerate()
            .position(|(i, line)| !(options.exclusive && consumed[i]) && *line == raw);
        match hit {
            Some(i) => {
                result.matched += 1;
                if options.exclusive {
                    consumed[i] = true;
                }
            }
            None => result.unmatched.push(event.raw.clone()),
        }
        if let Some(problem) = options.metadata.as_ref().and_then(|m| m.check(event)) {
            result.metadata_mismatches.push(problem);
        }
    }
    result
}

pub struct EventReconciler {
    backend: Arc<dyn SearchBackend>,
    options: MatchOptions,
    span: Span,
}

impl EventReconciler {
    pub fn new(backend: Arc<dyn SearchBackend>, options: MatchOptions, span: Span) -> Self {
        Self {
            backend,
            options,
            span,
        }
    }

    pub async fn reconcile(
        &self,
        filter: &SearchFilter,
        source_lines: &[SourceLogLine],
    ) -> Result<ReconcileResult, BackendError> {
        async {
            info!("Query: {}", filter);
            let events = self.backend.search(filter).await?;
            info!("Backend returned {} events", events.len());
            let result = reconcile_events(&events, source_lines, &self.options);
            for raw in &result.unmatched {
                warn!("No source line for event: {:?}", raw);
            }
            for problem in &result.metadata_mismatches {
                warn!("Metadata mismatch: {}", problem);
            }
            debug!(
                "Matched {}/{} events against {} source lines",
                result.matched,
                result.total_events,
                source_lines.len()
            );
            Ok::<_, BackendError>(result)
        }
        .instrument(self.span.clone())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splunk::IndexKind;
    use crate::types::{MetricPoint, TimeRange};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedBackend {
        events: Mutex<Result<Vec<BackendEvent>, u16>>,
    }

    impl FixedBackend {
        fn with_events(raws: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Ok(raws.iter().map(|r| BackendEvent::with_raw(*r)).collect())),
            })
        }

        fn failing(code: u16) -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Err(code)),
            })
        }
    }

    #[async_trait]
    impl SearchBackend for FixedBackend {
        async fn search(&self, _filter: &SearchFilter) -> Result<Vec<BackendEvent>, BackendError> {
            match &*self.events.lock().unwrap() {
                Ok(events) => Ok(events.clone()),
                Err(code) => Err(BackendError::Status {
                    code: *code,
                    body: "Service Unavailable".to_string(),
                }),
            }
        }

        async fn search_metrics(
            &self,
            _index: &str,
            _metric_name: &str,
            _range: &TimeRange,
        ) -> Result<Vec<MetricPoint>, BackendError> {
            Ok(vec![])
        }

        async fn create_index(&self, _name: &str, _kind: IndexKind) -> Result<(), BackendError> {
            Ok(())
        }

        async fn delete_index(&self, _name: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn lines(raw: &[&str]) -> Vec<SourceLogLine> {
        raw.iter().map(|l| SourceLogLine::from(*l)).collect()
    }

    fn events(raw: &[&str]) -> Vec<BackendEvent> {
        raw.iter().map(|r| BackendEvent::with_raw(*r)).collect()
    }

    fn reconciler(backend: Arc<FixedBackend>) -> EventReconciler {
        EventReconciler::new(backend, MatchOptions::default(), Span::none())
    }

    #[tokio::test]
    async fn test_every_event_traced() {
        let r = reconciler(FixedBackend::with_events(&["A", "B"]));
        let result = r
            .reconcile(&SearchFilter::events("main"), &lines(&["A", "B", "C"]))
            .await
            .unwrap();
        assert_eq!(result.matched, 2);
        assert_eq!(result.total_events, 2);
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn test_untraceable_event_reported() {
        let r = reconciler(FixedBackend::with_events(&["A", "X"]));
        let result = r
            .reconcile(&SearchFilter::events("main"), &lines(&["A", "B"]))
            .await
            .unwrap();
        assert_eq!(result.matched, 1);
        assert_eq!(result.total_events, 2);
        assert_eq!(result.unmatched, vec!["X".to_string()]);
        assert!(!result.is_consistent());
    }

    #[tokio::test]
    async fn test_no_events_is_consistent() {
        let r = reconciler(FixedBackend::with_events(&[]));
        let result = r
            .reconcile(&SearchFilter::events("main"), &lines(&["A"]))
            .await
            .unwrap();
        assert_eq!(result.matched, 0);
        assert_eq!(result.total_events, 0);
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn test_repeated_calls_agree() {
        let r = reconciler(FixedBackend::with_events(&["A", "A", "B", "Z"]));
        let source = lines(&["A", "B", "A"]);
        let filter = SearchFilter::events("main");
        let first = r.reconcile(&filter, &source).await.unwrap();
        let second = r.reconcile(&filter, &source).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.matched, 3);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let r = reconciler(FixedBackend::failing(503));
        let err = r
            .reconcile(&SearchFilter::events("main"), &lines(&["A"]))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_more_source_lines_never_lower_matches() {
        let evs = events(&["A", "A", "B", "C", "D"]);
        let options = MatchOptions::default();
        let mut source = lines(&["B"]);
        let mut previous = reconcile_events(&evs, &source, &options).matched;
        for extra in ["A", "Q", "A", "D", "A", "C"] {
            source.push(SourceLogLine::from(extra));
            let matched = reconcile_events(&evs, &source, &options).matched;
            assert!(matched >= previous);
            previous = matched;
        }
        assert_eq!(previous, 5);
    }

    #[test]
    fn test_duplicate_events_need_duplicate_lines() {
        let evs = events(&["A", "A"]);
        let source = lines(&["A"]);
        let exclusive = reconcile_events(&evs, &source, &MatchOptions::default());
        assert_eq!(exclusive.matched, 1);

        let shared = MatchOptions {
            exclusive: false,
            ..Default::default()
        };
        assert_eq!(reconcile_events(&evs, &source, &shared).matched, 2);
    }

    #[test]
    fn test_trim_flag() {
        let evs = events(&["2024-05-01T10:00:00Z info started "]);
        let source = lines(&["2024-05-01T10:00:00Z info started\n"]);
        assert_eq!(
            reconcile_events(&evs, &source, &MatchOptions::default()).matched,
            1
        );
        let exact = MatchOptions {
            trim: false,
            ..Default::default()
        };
        assert_eq!(reconcile_events(&evs, &source, &exact).matched, 0);
    }

    #[test]
    fn test_metadata_expectation() {
        let pod = "sck-splunk-otel-collector-agent-7xq2p";
        let mut good = BackendEvent::with_raw("A");
        good.sourcetype = "kube:container:otel-collector".to_string();
        good.source = format!(
            "/var/log/pods/default_{}_3f1e2d4c-9b8a-4c7d-8e6f-0a1b2c3d4e5f/otel-collector/0.log",
            pod
        );
        good.fields.insert("k8s.pod.name".to_string(), pod.to_string());
        let mut bad = good.clone();
        bad.raw = "B".to_string();
        bad.source = "/var/log/containers/whatever.log".to_string();

        let options = MatchOptions {
            metadata: Some(MetadataExpectation {
                sourcetype: Some("kube:container:otel-collector".to_string()),
                source_pattern: Some(pod_log_source_pattern(
                    "default",
                    pod,
                    Some("otel-collector"),
                )
                .unwrap()),
                fields: BTreeMap::from([("k8s.pod.name".to_string(), pod.to_string())]),
            }),
            ..Default::default()
        };
        let result = reconcile_events(&[good, bad], &lines(&["A", "B"]), &options);
        assert_eq!(result.matched, 2);
        assert_eq!(result.metadata_mismatches.len(), 1);
        assert!(result.metadata_mismatches[0].contains("source="));
        assert!(!result.is_consistent());
    }

    #[test]
    fn test_source_pattern_any_container() {
        let re = pod_log_source_pattern("monitoring", "agent-1", None).unwrap();
        assert!(re.is_match("/var/log/pods/monitoring_agent-1_abc-123/otel-collector/12.log"));
        assert!(!re.is_match("/var/log/pods/monitoring_agent-2_abc-123/otel-collector/0.log"));
        assert!(!re.is_match("/var/log/pods/monitoring_agent-1_abc/otel/collector/0.log"));
    }
}
