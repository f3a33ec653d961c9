//! Process-wide settings, resolved once from the command line and the `CI_*`
//! environment and read-only afterwards.

use crate::cli::{Cli, OrchestratorBackend, PollArgs, SplunkArgs};
use crate::error::ConfigError;
use crate::readiness::PollSettings;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SplunkSettings {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub search_polls: u32,
}

impl SplunkSettings {
    pub fn resolve(args: &SplunkArgs) -> Result<Self, ConfigError> {
        let base_url = match (&args.splunkd_url, &args.splunk_host) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, Some(host)) => format!("https://{}:{}", host, args.splunk_port),
            (None, None) => {
                return Err(ConfigError::Missing {
                    flag: "--splunk-host",
                    env: "CI_SPLUNK_HOST",
                });
            }
        };
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(ConfigError::Invalid {
                what: "splunkd url".to_string(),
                reason: format!("{:?} must start with http:// or https://", base_url),
            });
        }
        let password = args
            .splunk_password
            .clone()
            .ok_or(ConfigError::Missing {
                flag: "--splunk-password",
                env: "CI_SPLUNK_PASSWORD",
            })?;
        Ok(Self {
            base_url,
            user: args.splunk_user.clone(),
            password,
            search_polls: args.search_polls,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Indexes {
    pub events: String,
    pub metrics: String,
    pub traces: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub context: Option<String>,
    pub backend: OrchestratorBackend,
    pub call_timeout: Duration,
    pub indexes: Indexes,
    pub splunk_host: Option<String>,
    pub hec_token: Option<String>,
    splunk: Result<SplunkSettings, ConfigError>,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Self {
        let s = &cli.splunk;
        Self {
            namespace: cli.namespace.clone(),
            context: cli.context.clone(),
            backend: cli.backend,
            call_timeout: cli.call_timeout,
            indexes: Indexes {
                events: s.events_index.clone(),
                metrics: s.metrics_index.clone(),
                traces: s.traces_index.clone(),
            },
            splunk_host: s.splunk_host.clone(),
            hec_token: s.hec_token.clone(),
            splunk: SplunkSettings::resolve(s),
        }
    }

    /// Backend connection settings; commands that search call this before
    /// doing anything else.
    pub fn splunk(&self) -> Result<&SplunkSettings, ConfigError> {
        self.splunk.as_ref().map_err(Clone::clone)
    }

    /// HEC endpoint the collector should send to, derived from the host.
    pub fn hec_endpoint(&self) -> Option<String> {
        self.splunk_host
            .as_ref()
            .map(|host| format!("https://{}:8088/services/collector", host))
    }

    /// Values available to `${NAME}` placeholders in suite files.
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([
            ("NAMESPACE".to_string(), self.namespace.clone()),
            ("CI_INDEX_EVENTS".to_string(), self.indexes.events.clone()),
            ("CI_INDEX_METRICS".to_string(), self.indexes.metrics.clone()),
            ("CI_INDEX_TRACES".to_string(), self.indexes.traces.clone()),
        ]);
        if let Some(host) = &self.splunk_host {
            vars.insert("CI_SPLUNK_HOST".to_string(), host.clone());
        }
        if let Some(endpoint) = self.hec_endpoint() {
            vars.insert("HEC_ENDPOINT".to_string(), endpoint);
        }
        if let Some(token) = &self.hec_token {
            vars.insert("CI_SPLUNK_HEC_TOKEN".to_string(), token.clone());
        }
        vars
    }

    pub fn poll_settings(&self, args: &PollArgs) -> PollSettings {
        PollSettings {
            max_attempts: args.max_attempts,
            interval: args.interval,
            settle: args.settle,
            call_timeout: self.call_timeout,
            empty_is_ready: args.allow_empty,
        }
    }
}
