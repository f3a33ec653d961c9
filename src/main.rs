mod cli;
mod config;
mod error;
mod helm;
mod kubernetes;
mod readiness;
mod reconcile;
mod scenario;
mod splunk;
mod types;
mod utils;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn};

use cli::{Cli, Command, HelmArgs, IndexAction, OrchestratorBackend};
use config::Settings;
use helm::{Deployer, HelmDeployer};
use kubernetes::{KubeOrchestrator, KubectlOrchestrator, Orchestrator};
use readiness::ReadinessPoller;
use scenario::{Check, Expect, Suite, SuiteRunner};
use splunk::{IndexKind, SearchBackend, SplunkClient};
use types::{SearchFilter, TimeRange};
use utils::parse_overrides;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_cli(&cli);
    let passed = run(&cli, &settings).await?;
    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

/// Dispatch one subcommand; `false` means a check failed.
async fn run(cli: &Cli, settings: &Settings) -> anyhow::Result<bool> {
    match &cli.command {
        Command::Wait { poll, strict } => {
            let orchestrator = orchestrator(settings).await?;
            let poller = ReadinessPoller::new(
                orchestrator,
                settings.namespace.clone(),
                settings.poll_settings(poll),
                info_span!("wait", namespace = %settings.namespace),
            );
            let result = poller.poll_until_ready().await;
            println!(
                "ready={} attempts={} running={}/{}",
                result.ready,
                result.attempts_used,
                result.last_snapshot.running(),
                result.last_snapshot.total()
            );
            Ok(result.ready || !strict)
        }
        Command::Search { query, range, show } => {
            let backend = backend(settings)?;
            let filter = SearchFilter::raw(query.as_str())
                .within(TimeRange::new(&range.earliest, &range.latest));
            info!("Query: {}", filter);
            let events = backend.search(&filter).await?;
            println!("{} event(s)", events.len());
            if *show {
                for event in &events {
                    println!("{}", event.raw);
                }
            }
            Ok(true)
        }
        Command::Metrics {
            name,
            index,
            earliest,
            latest,
        } => {
            let backend = backend(settings)?;
            let index = index.as_deref().unwrap_or(&settings.indexes.metrics);
            let points = backend
                .search_metrics(index, name, &TimeRange::new(earliest, latest))
                .await?;
            println!("{} point(s) of {} in {}", points.len(), name, index);
            for point in &points {
                println!("{} {} {}", point.timestamp.to_rfc3339(), point.name, point.value);
            }
            Ok(true)
        }
        Command::Reconcile {
            pod,
            container,
            index,
            source,
            range,
            exact,
            shared_lines,
            sourcetype,
            check_source_path,
        } => {
            let backend = backend(settings)?;
            let orchestrator = orchestrator(settings).await?;
            let runner = SuiteRunner::new(
                orchestrator,
                backend,
                settings.namespace.clone(),
                Default::default(),
            );
            let check = Check::AgentLogs {
                pod: pod.clone(),
                container: container.clone(),
                index: index.clone(),
                source: source.clone(),
                range: TimeRange::new(&range.earliest, &range.latest),
                trim: !exact,
                exclusive: !shared_lines,
                sourcetype: sourcetype.clone(),
                check_source_path: *check_source_path,
                expect_events: Expect::at_least(0),
                save_pod_as: None,
            };
            let verdict = runner.run_check(&check).await?;
            println!("{}", verdict.detail);
            Ok(verdict.passed)
        }
        Command::Index { action } => {
            let backend = backend(settings)?;
            match action {
                IndexAction::Create { name, metrics } => {
                    let kind = if *metrics {
                        IndexKind::Metric
                    } else {
                        IndexKind::Event
                    };
                    backend.create_index(name, kind).await?;
                    println!("created {} index {}", kind, name);
                }
                IndexAction::Delete { name } => {
                    backend.delete_index(name).await?;
                    println!("deleted index {}", name);
                }
            }
            Ok(true)
        }
        Command::Deploy {
            values,
            set,
            helm,
            poll,
        } => {
            let overrides = parse_overrides(set).map_err(|e| anyhow::anyhow!(e))?;
            let orchestrator = orchestrator(settings).await?;
            let deployer = deployer(settings, helm);
            let upgraded = deployer.deploy_or_upgrade(values, &overrides).await?;
            if !upgraded {
                warn!("Helm did not report success; waiting for pods anyway");
            }
            let poller = ReadinessPoller::new(
                orchestrator,
                settings.namespace.clone(),
                settings.poll_settings(poll),
                info_span!("wait", namespace = %settings.namespace),
            );
            let result = poller.poll_until_ready().await;
            Ok(upgraded && result.ready)
        }
        Command::Run {
            suite,
            filter,
            work_dir,
            helm,
            poll,
        } => {
            let suite = match suite {
                Some(path) => Suite::load(path)?,
                None => Suite::builtin()?,
            };
            let backend = backend(settings)?;
            let orchestrator = orchestrator(settings).await?;
            let runner = SuiteRunner::new(
                orchestrator,
                backend,
                settings.namespace.clone(),
                settings.poll_settings(poll),
            )
            .with_deployer(deployer(settings, helm))
            .with_vars(settings.vars())
            .with_metrics_index(settings.indexes.metrics.clone());
            let runner = match work_dir {
                Some(dir) => runner.with_work_dir(dir),
                None => runner,
            };

            let outcomes = runner.run(&suite, filter.as_deref()).await;
            for outcome in &outcomes {
                let mark = if outcome.passed { "PASS" } else { "FAIL" };
                println!("{} {}: {}", mark, outcome.name, outcome.detail);
            }
            let (passed, failed) = scenario::summary(&outcomes);
            println!("{} passed, {} failed", passed, failed);
            if outcomes.is_empty() {
                warn!("No scenario matched");
            }
            Ok(failed == 0)
        }
        Command::Dump {
            indexes,
            earliest,
            show,
        } => {
            let backend = backend(settings)?;
            for index in indexes {
                let filter = SearchFilter::events(index)
                    .text("| fields *")
                    .within(TimeRange::since(earliest));
                match backend.search(&filter).await {
                    Ok(events) => {
                        println!("index={} event count={}", index, events.len());
                        if *show {
                            for event in &events {
                                println!("{:?}", event);
                            }
                        }
                    }
                    Err(e) => error!("index={}: {}", index, e),
                }
            }
            let metrics = &settings.indexes.metrics;
            let filter = SearchFilter::metrics_preview(metrics).within(TimeRange::since("-24h@h"));
            match backend.search(&filter).await {
                Ok(events) => println!("metric index={} event count={}", metrics, events.len()),
                Err(e) => error!("metric index={}: {}", metrics, e),
            }
            Ok(true)
        }
    }
}

async fn orchestrator(settings: &Settings) -> anyhow::Result<Arc<dyn Orchestrator>> {
    let orchestrator: Arc<dyn Orchestrator> = match settings.backend {
        OrchestratorBackend::Kube => Arc::new(
            KubeOrchestrator::connect(settings.context.as_deref(), settings.call_timeout).await?,
        ),
        OrchestratorBackend::Kubectl => Arc::new(KubectlOrchestrator::new(
            settings.context.clone(),
            settings.call_timeout,
        )),
    };
    Ok(orchestrator)
}

fn backend(settings: &Settings) -> anyhow::Result<Arc<dyn SearchBackend>> {
    let splunk = settings.splunk()?;
    info!("Using search backend {}", splunk.base_url);
    let client = SplunkClient::new(
        &splunk.base_url,
        &splunk.user,
        &splunk.password,
        settings.call_timeout,
    )?
    .with_job_polling(splunk.search_polls, Duration::from_secs(1));
    Ok(Arc::new(client))
}

fn deployer(settings: &Settings, helm: &HelmArgs) -> Arc<dyn Deployer> {
    Arc::new(HelmDeployer {
        release: helm.release.clone(),
        chart: helm.chart.clone(),
        namespace: settings.namespace.clone(),
        context: settings.context.clone(),
        timeout: helm.helm_timeout,
    })
}
