//! `eydeploy.yml`: per-application overrides of pipeline steps and extra
//! named tasks, shipped in the repository.
//!
//! ```yaml
//! steps:
//!   migrate:
//!     before:
//!       - info: "migrating {{app}}"
//!     replace: true
//!     after:
//!       - run: "bin/rake data:backfill"
//!         roles: [app_master, solo]
//! tasks:
//!   warm_cache:
//!     - run: "curl -s localhost/warm"
//! ```

use crate::actions::ActionStep;
use crate::config::ConfigStore;
use crate::error::{DeployError, Result};
use crate::io::first_existing;
use crate::pipeline::Step;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Looked up in the repository cache, first match wins.
pub const MANIFEST_CANDIDATES: &[&str] = &["eydeploy.yml", "config/eydeploy.yml"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepOverride {
    /// Drop the default behavior instead of calling through to it.
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub before: Vec<ActionStep>,
    #[serde(default)]
    pub after: Vec<ActionStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomTasks {
    #[serde(default)]
    pub steps: BTreeMap<String, StepOverride>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Vec<ActionStep>>,
}

impl CustomTasks {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let tasks: CustomTasks = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        tasks.validate()?;
        Ok(tasks)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        for name in self.steps.keys() {
            if name.parse::<Step>().is_err() {
                return Err(format!("unknown deploy step '{name}' under steps"));
            }
        }
        for name in self.tasks.keys() {
            if name.parse::<Step>().is_ok() {
                return Err(format!(
                    "task '{name}' has the name of a deploy step; override it under steps instead"
                ));
            }
        }
        Ok(())
    }

    /// Step overrides with their names resolved.
    pub fn step_overrides(&self) -> Vec<(Step, &StepOverride)> {
        self.steps
            .iter()
            .filter_map(|(name, o)| name.parse::<Step>().ok().map(|step| (step, o)))
            .collect()
    }

    pub fn task(&self, name: &str) -> Option<&[ActionStep]> {
        self.tasks.get(name).map(Vec::as_slice)
    }
}

/// A manifest together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedTasks {
    pub path: PathBuf,
    pub tasks: CustomTasks,
}

/// Load the manifest from `repository_cache`. `Ok(None)` when disabled by
/// `eydeploy_rb: false` or when no manifest exists.
pub fn load(config: &ConfigStore, repository_cache: &Path) -> Result<Option<LoadedTasks>> {
    if !config.eydeploy_rb() {
        return Ok(None);
    }
    let candidates: Vec<PathBuf> = MANIFEST_CANDIDATES
        .iter()
        .map(|name| repository_cache.join(name))
        .collect();
    let Some(path) = first_existing(&candidates) else {
        return Ok(None);
    };

    let parsed = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| CustomTasks::parse(&text));
    match parsed {
        Ok(tasks) => {
            info!("Loading deploy customizations from {}", path.display());
            Ok(Some(LoadedTasks { path, tasks }))
        }
        Err(message) => {
            let err = DeployError::CustomTasks { path, message };
            error!("{err}");
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::config::source_from;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(value: serde_json::Value) -> ConfigStore {
        ConfigStore::from_source(source_from(value))
    }

    #[test]
    fn parses_overrides_and_tasks() {
        let tasks = CustomTasks::parse(
            "steps:\n  migrate:\n    replace: true\n    after:\n      - task: warm\ntasks:\n  warm:\n    - info: hi\n",
        )
        .unwrap();
        let overrides = tasks.step_overrides();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].0, Step::Migrate);
        assert!(overrides[0].1.replace);
        assert!(overrides[0].1.before.is_empty());
        assert_eq!(
            tasks.task("warm").unwrap()[0].action,
            Action::Info("hi".to_string())
        );
    }

    #[test]
    fn rejects_unknown_step_and_colliding_task() {
        let err = CustomTasks::parse("steps:\n  deploy_everything: {}\n").unwrap_err();
        assert!(err.contains("deploy_everything"));
        let err = CustomTasks::parse("tasks:\n  restart: []\n").unwrap_err();
        assert!(err.contains("name of a deploy step"));
        assert!(CustomTasks::parse("stepz: {}\n").is_err());
    }

    #[test]
    fn load_prefers_root_manifest() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("eydeploy.yml"), "tasks:\n  a: []\n").unwrap();
        std::fs::write(dir.path().join("config/eydeploy.yml"), "tasks:\n  b: []\n").unwrap();
        let loaded = load(&config(json!({})), dir.path()).unwrap().unwrap();
        assert_eq!(loaded.path, dir.path().join("eydeploy.yml"));
        assert!(loaded.tasks.task("a").is_some());
    }

    #[test]
    fn load_is_gated_and_absence_is_fine() {
        let dir = TempDir::new().unwrap();
        assert!(load(&config(json!({})), dir.path()).unwrap().is_none());
        std::fs::write(dir.path().join("eydeploy.yml"), "not: [valid").unwrap();
        assert!(load(&config(json!({"eydeploy_rb": "false"})), dir.path())
            .unwrap()
            .is_none());
        assert!(load(&config(json!({"eydeploy_rb": null})), dir.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn load_failure_names_the_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/eydeploy.yml"), "steps:\n  nope: {}\n").unwrap();
        let err = load(&config(json!({})), dir.path()).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Exception while loading "));
        assert!(message.contains("config/eydeploy.yml"));
    }
}
