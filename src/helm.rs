use crate::error::DeployError;
use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const UPGRADED_MARKER: &str = "has been upgraded";
const DEPLOYED_MARKER: &str = "STATUS: deployed";

#[async_trait]
pub trait Deployer: Send + Sync {
    /// Install or upgrade the collector release. `overrides` are dotted-path
    /// values applied on top of `values_file`.
    async fn deploy_or_upgrade(
        &self,
        values_file: &Path,
        overrides: &BTreeMap<String, String>,
    ) -> Result<bool, DeployError>;
}

#[derive(Debug, Clone)]
pub struct HelmDeployer {
    pub release: String,
    pub chart: String,
    pub namespace: String,
    pub context: Option<String>,
    pub timeout: Duration,
}

impl HelmDeployer {
    pub fn args(&self, values_file: &Path, overrides: &BTreeMap<String, String>) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.release.clone(),
            self.chart.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--values".to_string(),
            values_file.display().to_string(),
        ];
        for (key, value) in overrides {
            args.push("--set".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(ctx) = &self.context {
            args.push("--kube-context".to_string());
            args.push(ctx.clone());
        }
        args
    }
}

/// Helm reports success on stdout; both the upgrade and first-install
/// wordings count.
pub fn upgrade_succeeded(output: &str) -> bool {
    output
        .lines()
        .any(|l| l.contains(UPGRADED_MARKER) || l.contains(DEPLOYED_MARKER))
}

#[async_trait]
impl Deployer for HelmDeployer {
    async fn deploy_or_upgrade(
        &self,
        values_file: &Path,
        overrides: &BTreeMap<String, String>,
    ) -> Result<bool, DeployError> {
        let args = self.args(values_file, overrides);
        // --set values carry the HEC token
        let command = format!("helm upgrade --install {} {}", self.release, self.chart);
        info!("Running {} with values {}", command, values_file.display());
        debug!("Overriding {} value(s)", overrides.len());

        let run = Command::new("helm").args(&args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| DeployError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| DeployError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && upgrade_succeeded(&stdout) {
            info!("upgrade successful");
            return Ok(true);
        }
        warn!("upgrade failed ({})", output.status);
        for line in stdout.lines().chain(String::from_utf8_lossy(&output.stderr).lines()) {
            warn!("  {}", line);
        }
        Ok(false)
    }
}

/// Set `dotted` (e.g. `logsCollection.containers.excludeAgentLogs`) in a YAML
/// document, creating intermediate mappings as needed.
pub fn set_dotted(doc: &mut Value, dotted: &str, value: Value) -> Result<(), String> {
    let mut keys = dotted.split('.').peekable();
    let mut node = doc;
    while let Some(key) = keys.next() {
        if key.is_empty() {
            return Err(format!("empty segment in {:?}", dotted));
        }
        if node.is_null() {
            *node = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = node else {
            return Err(format!("{:?}: parent of {:?} is not a mapping", dotted, key));
        };
        let key = Value::String(key.to_string());
        if keys.peek().is_none() {
            map.insert(key, value);
            return Ok(());
        }
        node = map.entry(key).or_insert(Value::Null);
    }
    Err(format!("empty path {:?}", dotted))
}

/// Write a copy of `src` with `patches` applied to `dst`.
pub fn patch_values_file(
    src: &Path,
    dst: &Path,
    patches: &BTreeMap<String, Value>,
) -> Result<(), DeployError> {
    let values_error = |path: &Path, reason: String| DeployError::Values {
        path: path.display().to_string(),
        reason,
    };
    let text = std::fs::read_to_string(src).map_err(|e| values_error(src, e.to_string()))?;
    let mut doc: Value = serde_yaml::from_str(&text).map_err(|e| values_error(src, e.to_string()))?;
    for (key, value) in patches {
        set_dotted(&mut doc, key, value.clone()).map_err(|e| values_error(src, e))?;
    }
    let out = serde_yaml::to_string(&doc).map_err(|e| values_error(dst, e.to_string()))?;
    std::fs::write(dst, out).map_err(|e| values_error(dst, e.to_string()))?;
    debug!("Wrote patched values to {}", dst.display());
    Ok(())
}
