use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Required configuration option not found: {0:?}")]
    MissingConfig(String),

    #[error("invalid configuration for '{key}': {message}")]
    InvalidConfig { key: String, message: String },

    #[error("Both --git and --archive specified. Precedence is not defined. Aborting")]
    ConflictingSources,

    #[error("unknown {kind} '{name}'")]
    UnknownStrategy { kind: &'static str, name: String },

    #[error("unknown deploy step: {0}")]
    UnknownStep(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid instance specification: {0}")]
    InvalidServer(String),

    #[error(transparent)]
    Remote(#[from] RemoteFailure),

    #[error("Exception while loading {}: {message}", path.display())]
    CustomTasks { path: PathBuf, message: String },

    #[error("hook {} failed: {message}", path.display())]
    Hook { path: PathBuf, message: String },

    #[error("failed to run `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("rollback not possible: {0}")]
    Rollback(String),

    #[error("not deployed: {0}")]
    NotDeployed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;

// ---------------------------------------------------------------------------
// RemoteFailure
// ---------------------------------------------------------------------------

/// One server's failed command, with whatever output it produced.
#[derive(Debug, Clone)]
pub struct ServerFailure {
    pub hostname: String,
    pub command: String,
    pub output: String,
}

/// Aggregated failure of a fleet-wide command. Carries every failed server,
/// not just the first one.
#[derive(Debug, Clone, Error)]
pub struct RemoteFailure {
    pub failures: Vec<ServerFailure>,
}

impl RemoteFailure {
    pub fn single(hostname: impl Into<String>, command: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            failures: vec![ServerFailure {
                hostname: hostname.into(),
                command: command.into(),
                output: output.into(),
            }],
        }
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.hostname.as_str()).collect()
    }

    /// True if any failed server's output contains `needle`.
    pub fn output_contains(&self, needle: &str) -> bool {
        self.failures.iter().any(|f| f.output.contains(needle))
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "The following command failed on {}:\n  {}",
                failure.hostname, failure.command
            )?;
            let output = failure.output.trim_end();
            if !output.is_empty() {
                write!(f, "\n{output}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_names_the_key() {
        let err = DeployError::MissingConfig("app".to_string());
        assert_eq!(
            err.to_string(),
            "Required configuration option not found: \"app\""
        );
    }

    #[test]
    fn remote_failure_lists_every_server() {
        let failure = RemoteFailure {
            failures: vec![
                ServerFailure {
                    hostname: "app1".into(),
                    command: "rake db:migrate".into(),
                    output: "boom\n".into(),
                },
                ServerFailure {
                    hostname: "app2".into(),
                    command: "rake db:migrate".into(),
                    output: String::new(),
                },
            ],
        };
        let text = failure.to_string();
        assert!(text.contains("failed on app1"));
        assert!(text.contains("boom"));
        assert!(text.contains("failed on app2"));
        assert_eq!(failure.hostnames(), vec!["app1", "app2"]);
    }

    #[test]
    fn custom_task_error_mentions_path() {
        let err = DeployError::CustomTasks {
            path: PathBuf::from("/data/app/shared/cached-copy/eydeploy.yml"),
            message: "Imma blow up".into(),
        };
        let text = err.to_string();
        assert!(text.starts_with("Exception while loading /data/app/shared/cached-copy/eydeploy.yml"));
        assert!(text.contains("Imma blow up"));
    }
}
