//! Scenario suites: deploy the collector with some configuration, wait for
//! it, then assert on what reached the search backend.
//!
//! A suite is a YAML document. `${NAME}` placeholders in queries, values
//! paths and overrides are filled from the process settings before use.

use crate::error::{BackendError, OrchestratorError};
use crate::helm::{Deployer, patch_values_file};
use crate::kubernetes::Orchestrator;
use crate::readiness::{PollSettings, ReadinessPoller};
use crate::reconcile::{EventReconciler, MatchOptions, MetadataExpectation, pod_log_source_pattern};
use crate::splunk::{IndexKind, SearchBackend};
use crate::types::{POD_NAME_NOT_FOUND, SearchFilter, TimeRange};
use crate::utils::{expand_vars, parse_duration, slug, unresolved_vars};
use anyhow::Context;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Instrument, Span, debug, info, info_span, warn};

const DEFAULT_SUITE: &str = include_str!("../suites/default.yaml");

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    #[serde(default)]
    pub setup: Vec<Step>,
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub teardown: Vec<Step>,
}

impl Suite {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading suite {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing suite {}", path.display()))
    }

    /// The suite compiled into the binary.
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_yaml(DEFAULT_SUITE).context("parsing built-in suite")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    CreateIndex {
        name: String,
        #[serde(default)]
        metrics: bool,
    },
    DeleteIndex {
        name: String,
    },
    Deploy(DeployStep),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployStep {
    pub values: PathBuf,
    /// `--set` overrides, dotted path to value.
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Written into a copy of the values file before deploying.
    #[serde(default)]
    pub patch: BTreeMap<String, serde_yaml::Value>,
    #[serde(default = "yes")]
    pub wait: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub deploy: Option<DeployStep>,
    /// Pause between deploy and check, e.g. `10s`.
    #[serde(default, deserialize_with = "optional_duration")]
    pub delay: Option<Duration>,
    pub check: Check,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    /// Count of events returned by a query.
    Events {
        query: String,
        #[serde(default)]
        range: TimeRange,
        #[serde(default)]
        expect: Expect,
    },
    /// Data points of one metric.
    Metric {
        name: String,
        #[serde(default)]
        index: Option<String>,
        #[serde(default = "last_day")]
        range: TimeRange,
        #[serde(default)]
        expect: Expect,
    },
    /// A pod's ingested log events must all trace back to its own output.
    AgentLogs {
        #[serde(default = "agent")]
        pod: String,
        #[serde(default)]
        container: Option<String>,
        #[serde(default = "main_index")]
        index: String,
        #[serde(default = "collector_logs")]
        source: String,
        #[serde(default)]
        range: TimeRange,
        #[serde(default = "yes")]
        trim: bool,
        #[serde(default = "yes")]
        exclusive: bool,
        #[serde(default)]
        sourcetype: Option<String>,
        #[serde(default)]
        check_source_path: bool,
        #[serde(default)]
        expect_events: Expect,
        /// Remember the resolved pod name as `${NAME}` for later scenarios.
        #[serde(default)]
        save_pod_as: Option<String>,
    },
}

fn yes() -> bool {
    true
}

fn agent() -> String {
    "agent".to_string()
}

fn main_index() -> String {
    "main".to_string()
}

fn collector_logs() -> String {
    "*/otel-collector/*.log".to_string()
}

fn last_day() -> TimeRange {
    TimeRange::since("-24h@h")
}

fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Bounds on a count. With no bound set, at least one is expected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expect {
    pub at_least: Option<usize>,
    pub exactly: Option<usize>,
    pub at_most: Option<usize>,
}

impl Expect {
    pub fn at_least(n: usize) -> Self {
        Self {
            at_least: Some(n),
            ..Default::default()
        }
    }

    fn is_unbounded(&self) -> bool {
        self.at_least.is_none() && self.exactly.is_none() && self.at_most.is_none()
    }

    pub fn check(&self, n: usize) -> bool {
        if self.is_unbounded() {
            return n >= 1;
        }
        self.at_least.is_none_or(|min| n >= min)
            && self.exactly.is_none_or(|want| n == want)
            && self.at_most.is_none_or(|max| n <= max)
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            return f.write_str("at least 1");
        }
        let mut parts = Vec::new();
        if let Some(n) = self.exactly {
            parts.push(format!("exactly {}", n));
        }
        if let Some(n) = self.at_least {
            parts.push(format!("at least {}", n));
        }
        if let Some(n) = self.at_most {
            parts.push(format!("at most {}", n));
        }
        f.write_str(&parts.join(" and "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

pub struct SuiteRunner {
    orchestrator: Arc<dyn Orchestrator>,
    backend: Arc<dyn SearchBackend>,
    deployer: Option<Arc<dyn Deployer>>,
    namespace: String,
    poll: PollSettings,
    metrics_index: String,
    work_dir: PathBuf,
    vars: Mutex<BTreeMap<String, String>>,
}

impl SuiteRunner {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        backend: Arc<dyn SearchBackend>,
        namespace: impl Into<String>,
        poll: PollSettings,
    ) -> Self {
        Self {
            orchestrator,
            backend,
            deployer: None,
            namespace: namespace.into(),
            poll,
            metrics_index: "ci_metrics".to_string(),
            work_dir: std::env::temp_dir(),
            vars: Mutex::new(BTreeMap::new()),
        }
    }

    /// Without a deployer, deploy steps are skipped.
    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn with_vars(self, vars: BTreeMap<String, String>) -> Self {
        Self {
            vars: Mutex::new(vars),
            ..self
        }
    }

    pub fn with_metrics_index(mut self, index: impl Into<String>) -> Self {
        self.metrics_index = index.into();
        self
    }

    /// Where patched values files are written.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    fn expand(&self, text: &str) -> String {
        match self.vars.lock() {
            Ok(vars) => expand_vars(text, &vars),
            Err(poisoned) => expand_vars(text, &poisoned.into_inner()),
        }
    }

    fn remember(&self, name: &str, value: &str) {
        let mut vars = match self.vars.lock() {
            Ok(vars) => vars,
            Err(poisoned) => poisoned.into_inner(),
        };
        vars.insert(name.to_string(), value.to_string());
    }

    fn expand_value(&self, value: &serde_yaml::Value) -> serde_yaml::Value {
        match value {
            serde_yaml::Value::String(s) => serde_yaml::Value::String(self.expand(s)),
            other => other.clone(),
        }
    }

    /// Run setup, then every scenario whose name contains `filter`, then
    /// teardown. A failing scenario never stops the ones after it.
    pub async fn run(&self, suite: &Suite, filter: Option<&str>) -> Vec<ScenarioOutcome> {
        for step in &suite.setup {
            self.run_step(step, "setup").instrument(info_span!("setup")).await;
        }

        let mut outcomes = Vec::new();
        for scenario in suite
            .scenarios
            .iter()
            .filter(|s| filter.is_none_or(|f| s.name.contains(f)))
        {
            let span = info_span!("scenario", name = %scenario.name);
            let outcome = self.run_scenario(scenario).instrument(span).await;
            outcomes.push(outcome);
        }

        for step in &suite.teardown {
            self.run_step(step, "teardown")
                .instrument(info_span!("teardown"))
                .await;
        }
        outcomes
    }

    async fn run_scenario(&self, scenario: &Scenario) -> ScenarioOutcome {
        info!("Running scenario");
        if let Some(deploy) = &scenario.deploy {
            self.deploy(deploy, &scenario.name).await;
        }
        if let Some(delay) = scenario.delay {
            debug!("Waiting {:?} before checking", delay);
            tokio::time::sleep(delay).await;
        }

        let verdict = match self.run_check(&scenario.check).await {
            Ok(verdict) => verdict,
            Err(e) if is_infrastructure(&e) => Verdict {
                passed: false,
                detail: format!("infrastructure unavailable: {:#}", e),
            },
            Err(e) => Verdict {
                passed: false,
                detail: format!("error: {:#}", e),
            },
        };
        if verdict.passed {
            info!("PASS: {}", verdict.detail);
        } else {
            warn!("FAIL: {}", verdict.detail);
        }
        ScenarioOutcome {
            name: scenario.name.clone(),
            passed: verdict.passed,
            detail: verdict.detail,
        }
    }

    async fn run_step(&self, step: &Step, label: &str) {
        let result = match step {
            Step::CreateIndex { name, metrics } => {
                let kind = if *metrics {
                    IndexKind::Metric
                } else {
                    IndexKind::Event
                };
                self.backend.create_index(&self.expand(name), kind).await
            }
            Step::DeleteIndex { name } => self.backend.delete_index(&self.expand(name)).await,
            Step::Deploy(deploy) => {
                self.deploy(deploy, label).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("{} step failed: {}", label, e);
        }
    }

    /// Deploy failures are logged and the scenario carries on; its check
    /// reports the visible failure.
    async fn deploy(&self, step: &DeployStep, label: &str) {
        let Some(deployer) = &self.deployer else {
            warn!("No deployer configured; skipping deploy");
            return;
        };
        let mut values = PathBuf::from(self.expand(&step.values.to_string_lossy()));
        if !step.patch.is_empty() {
            let patched = self.work_dir.join(format!("{}-values.yaml", slug(label)));
            let patches: BTreeMap<String, serde_yaml::Value> = step
                .patch
                .iter()
                .map(|(k, v)| (k.clone(), self.expand_value(v)))
                .collect();
            if let Err(e) = patch_values_file(&values, &patched, &patches) {
                warn!("Skipping deploy: {}", e);
                return;
            }
            values = patched;
        }
        let overrides: BTreeMap<String, String> = step
            .set
            .iter()
            .map(|(k, v)| (k.clone(), self.expand(v)))
            .collect();

        match deployer.deploy_or_upgrade(&values, &overrides).await {
            Ok(true) => {}
            Ok(false) => warn!("Deploy did not report success; continuing"),
            Err(e) => warn!("Deploy failed: {}; continuing", e),
        }

        if step.wait {
            let poller = ReadinessPoller::new(
                self.orchestrator.clone(),
                self.namespace.clone(),
                self.poll.clone(),
                Span::current(),
            );
            let result = poller.poll_until_ready().await;
            if !result.ready {
                warn!(
                    "{}/{} pods running after deploy",
                    result.last_snapshot.running(),
                    result.last_snapshot.total()
                );
            }
        }
    }

    pub async fn run_check(&self, check: &Check) -> anyhow::Result<Verdict> {
        match check {
            Check::Events {
                query,
                range,
                expect,
            } => {
                let query = self.expand(query);
                if let Some(verdict) = unresolved(&query) {
                    return Ok(verdict);
                }
                let filter = SearchFilter::raw(query).within(range.clone());
                info!("Query: {}", filter);
                let events = self.backend.search(&filter).await?;
                Ok(Verdict {
                    passed: expect.check(events.len()),
                    detail: format!("{} event(s), expected {}", events.len(), expect),
                })
            }
            Check::Metric {
                name,
                index,
                range,
                expect,
            } => {
                let index = index
                    .as_deref()
                    .map(|i| self.expand(i))
                    .unwrap_or_else(|| self.metrics_index.clone());
                if let Some(verdict) = unresolved(&index) {
                    return Ok(verdict);
                }
                let points = self.backend.search_metrics(&index, name, range).await?;
                Ok(Verdict {
                    passed: expect.check(points.len()),
                    detail: format!(
                        "{} point(s) of {} in {}, expected {}",
                        points.len(),
                        name,
                        index,
                        expect
                    ),
                })
            }
            Check::AgentLogs {
                pod,
                container,
                index,
                source,
                range,
                trim,
                exclusive,
                sourcetype,
                check_source_path,
                expect_events,
                save_pod_as,
            } => {
                let index = self.expand(index);
                if let Some(verdict) = unresolved(&index) {
                    return Ok(verdict);
                }
                let pod = self.orchestrator.find_pod(&self.namespace, pod).await?;
                if pod == POD_NAME_NOT_FOUND {
                    return Ok(Verdict {
                        passed: false,
                        detail: format!("no pod in {} matches", self.namespace),
                    });
                }
                if let Some(var) = save_pod_as {
                    self.remember(var, &pod);
                }

                let lines = self
                    .orchestrator
                    .fetch_logs(&self.namespace, &pod, container.as_deref())
                    .await?;
                // Events ingested after the log fetch cannot be in `lines`.
                let range = pin_latest(range, chrono::Utc::now().timestamp());

                let metadata = if sourcetype.is_some() || *check_source_path {
                    let source_pattern = if *check_source_path {
                        Some(pod_log_source_pattern(
                            &self.namespace,
                            &pod,
                            container.as_deref(),
                        )?)
                    } else {
                        None
                    };
                    Some(MetadataExpectation {
                        sourcetype: sourcetype.clone(),
                        source_pattern,
                        fields: BTreeMap::new(),
                    })
                } else {
                    None
                };
                let options = MatchOptions {
                    trim: *trim,
                    exclusive: *exclusive,
                    metadata,
                };
                let filter = SearchFilter::events(&index)
                    .term("k8s.pod.name", &pod)
                    .term("source", source)
                    .within(range);

                let reconciler = EventReconciler::new(
                    self.backend.clone(),
                    options,
                    info_span!("reconcile", pod = %pod),
                );
                let result = reconciler.reconcile(&filter, &lines).await?;
                let count_ok = expect_events.check(result.total_events);
                let mut detail = format!(
                    "{}/{} events matched {} log lines, expected {} event(s)",
                    result.matched,
                    result.total_events,
                    lines.len(),
                    expect_events
                );
                if !result.metadata_mismatches.is_empty() {
                    detail.push_str(&format!(
                        ", {} metadata mismatch(es)",
                        result.metadata_mismatches.len()
                    ));
                }
                Ok(Verdict {
                    passed: count_ok && result.is_consistent(),
                    detail,
                })
            }
        }
    }
}

/// A failed verdict when `text` still holds `${NAME}` placeholders after
/// expansion; a literal placeholder in a search matches nothing.
fn unresolved(text: &str) -> Option<Verdict> {
    let names = unresolved_vars(text);
    if names.is_empty() {
        return None;
    }
    warn!("Unresolved placeholder(s) in {:?}", text);
    Some(Verdict {
        passed: false,
        detail: format!("unresolved placeholder(s) {} in {:?}", names.join(", "), text),
    })
}

/// Replace a `now` upper bound with a fixed epoch time.
fn pin_latest(range: &TimeRange, epoch_secs: i64) -> TimeRange {
    if range.latest == "now" {
        TimeRange::new(range.earliest.clone(), epoch_secs.to_string())
    } else {
        range.clone()
    }
}

fn is_infrastructure(e: &anyhow::Error) -> bool {
    if let Some(backend) = e.downcast_ref::<BackendError>() {
        return backend.is_unavailable();
    }
    e.downcast_ref::<OrchestratorError>().is_some()
}

pub fn summary(outcomes: &[ScenarioOutcome]) -> (usize, usize) {
    let passed = outcomes.iter().filter(|o| o.passed).count();
    (passed, outcomes.len() - passed)
}
