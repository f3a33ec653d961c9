use crate::utils::parse_duration;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "collector-e2e")]
#[command(about = "Check that collector telemetry from Kubernetes reaches Splunk")]
pub struct Cli {
    #[command(flatten)]
    pub splunk: SplunkArgs,

    /// Namespace the collector runs in
    #[arg(short = 'n', long, global = true, default_value = "default")]
    pub namespace: String,

    /// Context
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// How pod status and logs are read
    #[arg(long, global = true, value_enum, default_value_t = OrchestratorBackend::Kube)]
    pub backend: OrchestratorBackend,

    /// Upper bound on any single cluster or backend call
    #[arg(long, global = true, default_value = "30s", value_parser = parse_duration)]
    pub call_timeout: Duration,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrchestratorBackend {
    /// Kubernetes API through the kubeconfig
    Kube,
    /// The kubectl binary on PATH
    Kubectl,
}

#[derive(Args, Debug, Clone)]
pub struct SplunkArgs {
    /// Full management URL, e.g. https://localhost:8089 (wins over host/port)
    #[arg(long, global = true, env = "CI_SPLUNKD_URL")]
    pub splunkd_url: Option<String>,

    /// Splunk host
    #[arg(long, global = true, env = "CI_SPLUNK_HOST")]
    pub splunk_host: Option<String>,

    /// Splunk management port
    #[arg(long, global = true, env = "CI_SPLUNK_PORT", default_value_t = 8089)]
    pub splunk_port: u16,

    /// Splunk user
    #[arg(long, global = true, env = "CI_SPLUNK_USERNAME", default_value = "admin")]
    pub splunk_user: String,

    /// Status checks of a search job before giving up on it
    #[arg(long, global = true, default_value_t = 20)]
    pub search_polls: u32,

    /// Splunk password
    #[arg(long, global = true, env = "CI_SPLUNK_PASSWORD", hide_env_values = true)]
    pub splunk_password: Option<String>,

    /// HEC token handed to the collector on deploy
    #[arg(long, global = true, env = "CI_SPLUNK_HEC_TOKEN", hide_env_values = true)]
    pub hec_token: Option<String>,

    /// Index receiving logs and k8s objects
    #[arg(long, global = true, env = "CI_INDEX_EVENTS", default_value = "ci_events")]
    pub events_index: String,

    /// Metrics index
    #[arg(long, global = true, env = "CI_INDEX_METRICS", default_value = "ci_metrics")]
    pub metrics_index: String,

    /// Traces index
    #[arg(long, global = true, env = "CI_INDEX_TRACES", default_value = "ci_traces")]
    pub traces_index: String,
}

#[derive(Args, Debug, Clone)]
pub struct PollArgs {
    /// Status checks before giving up
    #[arg(long, default_value_t = 60)]
    pub max_attempts: u32,

    /// Delay between status checks
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub interval: Duration,

    /// Wait after readiness for the pipeline to warm up
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub settle: Duration,

    /// Count a namespace without pods as ready
    #[arg(long)]
    pub allow_empty: bool,
}

#[derive(Args, Debug, Clone)]
pub struct HelmArgs {
    /// Helm release name
    #[arg(long, default_value = "ci-sck")]
    pub release: String,

    /// Chart reference or path
    #[arg(long, default_value = "./helm-charts/splunk-otel-collector")]
    pub chart: String,

    /// Upper bound on one helm invocation
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    pub helm_timeout: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct RangeArgs {
    /// Earliest time modifier
    #[arg(long, default_value = "-5m@m", allow_hyphen_values = true)]
    pub earliest: String,

    /// Latest time modifier
    #[arg(long, default_value = "now", allow_hyphen_values = true)]
    pub latest: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Wait until every pod in the namespace is Running
    Wait {
        #[command(flatten)]
        poll: PollArgs,

        /// Exit non-zero when the pods never became ready
        #[arg(long)]
        strict: bool,
    },
    /// Run a search and print the number of events
    Search {
        /// Search query, e.g. "index=main k8s.pod.name=agent-1"
        query: String,

        #[command(flatten)]
        range: RangeArgs,

        /// Print the events as well
        #[arg(long)]
        show: bool,
    },
    /// Look up data points of one metric
    Metrics {
        /// Metric name, e.g. k8s.pod.cpu.utilization
        name: String,

        /// Metrics index (defaults to --metrics-index)
        #[arg(long)]
        index: Option<String>,

        #[arg(long, default_value = "-24h@h", allow_hyphen_values = true)]
        earliest: String,

        #[arg(long, default_value = "now", allow_hyphen_values = true)]
        latest: String,
    },
    /// Match a pod's ingested log events against its own log output
    Reconcile {
        /// Part of the pod name
        #[arg(default_value = "agent")]
        pod: String,

        /// Container name (if multi-container pod)
        #[arg(short = 'c', long)]
        container: Option<String>,

        /// Index holding the pod's logs
        #[arg(long, default_value = "main")]
        index: String,

        /// Source glob of the pod's log files
        #[arg(long, default_value = "*/otel-collector/*.log")]
        source: String,

        #[command(flatten)]
        range: RangeArgs,

        /// Compare lines without trimming whitespace
        #[arg(long)]
        exact: bool,

        /// Let one log line satisfy several events
        #[arg(long)]
        shared_lines: bool,

        /// Sourcetype every event must carry
        #[arg(long)]
        sourcetype: Option<String>,

        /// Require /var/log/pods/<ns>_<pod>_<uid>/<container>/<n>.log sources
        #[arg(long)]
        check_source_path: bool,
    },
    /// Create or delete a Splunk index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Install or upgrade the collector chart, then wait for its pods
    Deploy {
        /// Values file
        #[arg(short = 'f', long)]
        values: PathBuf,

        /// Dotted-path override, key=value (repeatable)
        #[arg(long = "set")]
        set: Vec<String>,

        #[command(flatten)]
        helm: HelmArgs,

        #[command(flatten)]
        poll: PollArgs,
    },
    /// Run a scenario suite
    Run {
        /// Suite file (YAML); the built-in suite when omitted
        #[arg(long)]
        suite: Option<PathBuf>,

        /// Only run scenarios whose name contains this text
        #[arg(long)]
        filter: Option<String>,

        /// Directory for patched values files
        #[arg(long)]
        work_dir: Option<PathBuf>,

        #[command(flatten)]
        helm: HelmArgs,

        #[command(flatten)]
        poll: PollArgs,
    },
    /// Print event counts per index
    Dump {
        /// Indexes to dump
        #[arg(default_values_t = ["main".to_string(), "ci_events".to_string(), "ns-anno".to_string(), "pod-anno".to_string()])]
        indexes: Vec<String>,

        #[arg(long, default_value = "-1h@h", allow_hyphen_values = true)]
        earliest: String,

        /// Print the events as well
        #[arg(long)]
        show: bool,
    },
}

#[derive(Subcommand)]
pub enum IndexAction {
    Create {
        name: String,

        /// Create a metrics index
        #[arg(long)]
        metrics: bool,
    },
    Delete { name: String },
}
