use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("{flag} is required (set {env})")]
    Missing { flag: &'static str, env: &'static str },
    #[error("invalid {what}: {reason}")]
    Invalid { what: String, reason: String },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("failed to run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{what} did not finish within {timeout:?}")]
    Timeout { what: String, timeout: Duration },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("search backend unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),
    #[error("search backend returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed search backend response: {0}")]
    Malformed(String),
    #[error("search job {sid} did not complete after {polls} status checks")]
    SearchTimeout { sid: String, polls: u32 },
}

impl BackendError {
    /// True when the backend could not be reached or failed server-side, as
    /// opposed to answering with something unusable.
    pub fn is_unavailable(&self) -> bool {
        match self {
            BackendError::Unavailable(_) | BackendError::SearchTimeout { .. } => true,
            BackendError::Status { code, .. } => *code >= 500,
            BackendError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("values file {path}: {reason}")]
    Values { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_split_on_server_side() {
        let server = BackendError::Status {
            code: 503,
            body: String::new(),
        };
        let client = BackendError::Status {
            code: 400,
            body: "bad search".to_string(),
        };
        assert!(server.is_unavailable());
        assert!(!client.is_unavailable());
        assert!(!BackendError::Malformed("no sid".to_string()).is_unavailable());
    }

    #[test]
    fn missing_config_names_the_variable() {
        let err = ConfigError::Missing {
            flag: "--splunk-host",
            env: "CI_SPLUNK_HOST",
        };
        assert_eq!(err.to_string(), "--splunk-host is required (set CI_SPLUNK_HOST)");
    }
}
