use crate::error::OrchestratorError;
use crate::types::{POD_NAME_NOT_FOUND, PodEntry, PodStatus, PodStatusSnapshot, SourceLogLine};
use async_trait::async_trait;
use futures::io::{AsyncBufRead, AsyncBufReadExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams};
use kube::{Api, Client, ResourceExt, config};
use std::future::Future;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Pod status and log access for one cluster.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> Result<PodStatusSnapshot, OrchestratorError>;

    async fn fetch_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
    ) -> Result<Vec<SourceLogLine>, OrchestratorError>;

    /// Full name of the first pod whose name contains `fragment`, or
    /// [`POD_NAME_NOT_FOUND`].
    async fn find_pod(&self, namespace: &str, fragment: &str) -> Result<String, OrchestratorError> {
        let snapshot = self.list_pods(namespace).await?;
        Ok(first_matching_pod(&snapshot, fragment))
    }
}

pub fn first_matching_pod(snapshot: &PodStatusSnapshot, fragment: &str) -> String {
    match snapshot.pods.iter().find(|p| p.name.contains(fragment)) {
        Some(pod) => {
            debug!("{} full name is: {}", fragment, pod.name);
            pod.name.clone()
        }
        None => POD_NAME_NOT_FOUND.to_string(),
    }
}

async fn bounded<T, F>(what: String, timeout: Duration, fut: F) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| OrchestratorError::Timeout { what, timeout })?
}

/// Status as `kubectl get pods` would print it.
pub fn pod_status(pod: &Pod) -> PodStatus {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodStatus::Other("Terminating".to_string());
    }
    let status = pod.status.as_ref();
    let waiting_reason = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses.iter().find_map(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|st| st.waiting.as_ref())
                    .and_then(|w| w.reason.clone())
            })
        });
    if let Some(reason) = waiting_reason {
        return PodStatus::Other(reason);
    }
    status
        .and_then(|s| s.phase.as_deref())
        .map(PodStatus::parse)
        .unwrap_or(PodStatus::Unknown)
}

pub struct KubeOrchestrator {
    client: Client,
    timeout: Duration,
}

impl KubeOrchestrator {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Build a client for `context`, or for the kubeconfig's current context.
    pub async fn connect(context: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let client = match context {
            Some(ctx) => {
                let config = config::Config::from_kubeconfig(&config::KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                })
                .await
                .map_err(|e| anyhow::anyhow!("Context '{}' not found in kubeconfig: {}", ctx, e))?;
                info!("Initialized client for context: {}", ctx);
                Client::try_from(config)?
            }
            None => {
                let config = config::Config::infer().await?;
                info!("Using current kubeconfig context");
                Client::try_from(config)?
            }
        };
        Ok(Self::new(client, timeout))
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_pods(&self, namespace: &str) -> Result<PodStatusSnapshot, OrchestratorError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("listing pods in {}", namespace);
        let pods = bounded(what, self.timeout, async {
            Ok::<_, OrchestratorError>(api.list(&ListParams::default()).await?)
        })
        .await?;
        Ok(PodStatusSnapshot::new(
            pods.items
                .iter()
                .map(|pod| PodEntry {
                    name: pod.name_any(),
                    status: pod_status(pod),
                })
                .collect(),
        ))
    }

    async fn fetch_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
    ) -> Result<Vec<SourceLogLine>, OrchestratorError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            follow: false,
            container: container.map(str::to_string),
            ..Default::default()
        };
        let what = format!("reading logs of {}/{}", namespace, pod_name);
        bounded(what, self.timeout, async {
            let stream = api.log_stream(pod_name, &lp).await?;
            let lines = read_lines_lossy(stream)
                .await
                .map_err(|e| OrchestratorError::Kube(kube::Error::ReadEvents(e)))?;
            debug!("Read {} log lines from pod {}", lines.len(), pod_name);
            Ok::<_, OrchestratorError>(lines)
        })
        .await
    }
}

/// Split a log body into lines. Invalid UTF-8 is replaced, as on the
/// `kubectl` path.
async fn read_lines_lossy<R: AsyncBufRead>(reader: R) -> std::io::Result<Vec<SourceLogLine>> {
    futures::pin_mut!(reader);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        lines.push(SourceLogLine::from(String::from_utf8_lossy(&buf).into_owned()));
    }
    Ok(lines)
}

/// Shells out to `kubectl` and parses its text output.
pub struct KubectlOrchestrator {
    context: Option<String>,
    timeout: Duration,
}

impl KubectlOrchestrator {
    pub fn new(context: Option<String>, timeout: Duration) -> Self {
        Self { context, timeout }
    }

    pub fn args<'a>(&'a self, namespace: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = Vec::new();
        if let Some(ctx) = &self.context {
            args.extend(["--context", ctx.as_str()]);
        }
        args.extend(["-n", namespace]);
        args.extend_from_slice(rest);
        args
    }

    async fn run(&self, args: Vec<&str>) -> Result<String, OrchestratorError> {
        let command = format!("kubectl {}", args.join(" "));
        debug!("Running {}", command);
        let output = bounded(command.clone(), self.timeout, async {
            Command::new("kubectl")
                .args(&args)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|source| OrchestratorError::Io {
                    command: command.clone(),
                    source,
                })
        })
        .await?;
        if !output.status.success() {
            return Err(OrchestratorError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Orchestrator for KubectlOrchestrator {
    async fn list_pods(&self, namespace: &str) -> Result<PodStatusSnapshot, OrchestratorError> {
        let out = self.run(self.args(namespace, &["get", "pods"])).await?;
        Ok(PodStatusSnapshot::parse_listing(&out))
    }

    async fn fetch_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
    ) -> Result<Vec<SourceLogLine>, OrchestratorError> {
        let mut rest = vec!["logs", pod_name];
        if let Some(c) = container {
            rest.extend(["-c", c]);
        }
        let out = self.run(self.args(namespace, &rest)).await?;
        Ok(out.lines().map(SourceLogLine::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus as K8sPodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("sck-agent-x1".to_string()),
                ..Default::default()
            },
            status: Some(K8sPodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_status_from_phase() {
        assert_eq!(pod_status(&pod("Running")), PodStatus::Running);
        assert_eq!(pod_status(&pod("Pending")), PodStatus::Pending);
        assert_eq!(pod_status(&Pod::default()), PodStatus::Unknown);
    }

    #[test]
    fn test_pod_status_prefers_waiting_reason() {
        let mut p = pod("Running");
        if let Some(status) = p.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "otel-collector".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("CrashLoopBackOff".to_string()),
                        message: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
        assert_eq!(
            pod_status(&p),
            PodStatus::Other("CrashLoopBackOff".to_string())
        );
    }

    #[test]
    fn test_pod_status_terminating() {
        let p: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "sck-agent-x1",
                "deletionTimestamp": "2024-05-01T10:00:00Z"
            },
            "status": { "phase": "Running" }
        }))
        .unwrap();
        assert_eq!(pod_status(&p), PodStatus::Other("Terminating".to_string()));
    }

    #[test]
    fn test_first_matching_pod() {
        let snapshot = PodStatusSnapshot::parse_listing(
            "NAME READY STATUS RESTARTS AGE\n\
             sck-splunk-otel-collector-k8s-cluster-receiver-5c 1/1 Running 0 1m\n\
             sck-splunk-otel-collector-agent-7xq2p 1/1 Running 0 1m\n",
        );
        assert_eq!(
            first_matching_pod(&snapshot, "agent"),
            "sck-splunk-otel-collector-agent-7xq2p"
        );
        assert_eq!(first_matching_pod(&snapshot, "gateway"), POD_NAME_NOT_FOUND);
    }

    #[test]
    fn test_kubectl_args_with_context() {
        let kubectl = KubectlOrchestrator::new(Some("kind-ci".to_string()), Duration::from_secs(5));
        assert_eq!(
            kubectl.args("default", &["get", "pods"]),
            vec!["--context", "kind-ci", "-n", "default", "get", "pods"]
        );
        let kubectl = KubectlOrchestrator::new(None, Duration::from_secs(5));
        assert_eq!(
            kubectl.args("monitoring", &["logs", "p", "-c", "c"]),
            vec!["-n", "monitoring", "logs", "p", "-c", "c"]
        );
    }

    #[tokio::test]
    async fn test_log_lines_survive_invalid_utf8() {
        let body: &[u8] = b"2024-05-01T10:00:00Z info started\r\n\xff\xfe binary noise\nlast line";
        let lines = read_lines_lossy(futures::io::Cursor::new(body)).await.unwrap();
        let lines: Vec<&str> = lines.iter().map(SourceLogLine::as_str).collect();
        assert_eq!(
            lines,
            vec![
                "2024-05-01T10:00:00Z info started",
                "\u{FFFD}\u{FFFD} binary noise",
                "last line"
            ]
        );

        let empty = read_lines_lossy(futures::io::Cursor::new(&b""[..])).await.unwrap();
        assert!(empty.is_empty());
    }
}
