//! Declarative action lists, shared by `<hook>.yml` files and the
//! `eydeploy.yml` custom-task manifest.
//!
//! ```yaml
//! - run: bundle exec rake cache:clear
//!   roles: [app_master, solo]
//! - info: "cache cleared for {{app}} in {{release_path}}"
//! ```

use crate::error::{DeployError, Result};
use crate::fleet::ServerFleet;
use crate::server::Role;
use crate::transport::CommandSpec;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Shell command on every server in scope.
    Run(String),
    /// As `Run`, through sudo.
    Sudo(String),
    /// Shell command once, on the orchestrator.
    RunLocal(String),
    Info(String),
    Warning(String),
    /// Invoke a pipeline step or custom task by name.
    Task(String),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Run(_) => "run",
            Action::Sudo(_) => "sudo",
            Action::RunLocal(_) => "run_local",
            Action::Info(_) => "info",
            Action::Warning(_) => "warning",
            Action::Task(_) => "task",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub struct ActionStep {
    pub action: Action,
    /// Restrict `run`/`sudo` to servers with any of these roles.
    pub roles: Option<Vec<Role>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sudo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_local: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    roles: Option<Vec<Role>>,
}

impl TryFrom<RawAction> for ActionStep {
    type Error = String;

    fn try_from(raw: RawAction) -> std::result::Result<Self, String> {
        let mut actions: Vec<Action> = [
            raw.run.map(Action::Run),
            raw.sudo.map(Action::Sudo),
            raw.run_local.map(Action::RunLocal),
            raw.info.map(Action::Info),
            raw.warning.map(Action::Warning),
            raw.task.map(Action::Task),
        ]
        .into_iter()
        .flatten()
        .collect();
        if actions.len() != 1 {
            return Err(format!(
                "each action needs exactly one of run, sudo, run_local, info, warning, task (found {})",
                actions.len()
            ));
        }
        let action = actions.remove(0);
        if raw.roles.is_some() && !matches!(action, Action::Run(_) | Action::Sudo(_)) {
            return Err(format!("roles only apply to run and sudo, not {}", action.kind()));
        }
        Ok(ActionStep {
            action,
            roles: raw.roles,
        })
    }
}

impl From<ActionStep> for RawAction {
    fn from(step: ActionStep) -> Self {
        let mut raw = RawAction {
            roles: step.roles,
            ..RawAction::default()
        };
        match step.action {
            Action::Run(s) => raw.run = Some(s),
            Action::Sudo(s) => raw.sudo = Some(s),
            Action::RunLocal(s) => raw.run_local = Some(s),
            Action::Info(s) => raw.info = Some(s),
            Action::Warning(s) => raw.warning = Some(s),
            Action::Task(s) => raw.task = Some(s),
        }
        raw
    }
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

static VAR_RE: OnceLock<Regex> = OnceLock::new();

fn var_re() -> &'static Regex {
    VAR_RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("static pattern")
    })
}

/// Replace every `{{key}}` using `lookup`. An unknown key is an error
/// naming it.
pub fn interpolate(template: &str, lookup: &dyn Fn(&str) -> Option<String>) -> std::result::Result<String, String> {
    let mut missing = None;
    let out = var_re().replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        match lookup(key) {
            Some(v) => v,
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(format!("unknown key '{key}' in {template:?}")),
        None => Ok(out.into_owned()),
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What an action list runs against.
pub struct ActionEnv<'a> {
    pub fleet: &'a ServerFleet,
    pub dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub lookup: &'a dyn Fn(&str) -> Option<String>,
}

/// Run `steps` in order, stopping at the first failure. `task` actions are
/// handed to `invoke`. Errors come back as plain messages for the caller to
/// attach a path to.
pub fn execute(
    steps: &[ActionStep],
    ctx: &ActionEnv<'_>,
    invoke: &mut dyn FnMut(&str) -> Result<()>,
) -> std::result::Result<(), ActionError> {
    for step in steps {
        let text = match &step.action {
            Action::Run(s)
            | Action::Sudo(s)
            | Action::RunLocal(s)
            | Action::Info(s)
            | Action::Warning(s)
            | Action::Task(s) => interpolate(s, ctx.lookup).map_err(ActionError::Invalid)?,
        };
        let spec = |command: String, sudo: bool| {
            let mut spec = CommandSpec::new(command).with_env(ctx.env.clone());
            spec.sudo = sudo;
            if let Some(dir) = &ctx.dir {
                spec = spec.in_dir(dir.clone());
            }
            spec
        };
        let scoped = |fleet: &ServerFleet| match &step.roles {
            Some(roles) => fleet.select(roles),
            None => fleet.clone(),
        };
        match &step.action {
            Action::Run(_) => {
                scoped(ctx.fleet).run(spec(text, false)).map_err(ActionError::Failed)?;
            }
            Action::Sudo(_) => {
                scoped(ctx.fleet).run(spec(text, true)).map_err(ActionError::Failed)?;
            }
            Action::RunLocal(_) => {
                let output = ctx
                    .fleet
                    .run_local_strict(&spec(text, false))
                    .map_err(ActionError::Failed)?;
                if !output.output.trim().is_empty() {
                    info!("{}", output.output.trim_end());
                }
            }
            Action::Info(_) => info!("{text}"),
            Action::Warning(_) => warn!("{text}"),
            Action::Task(_) => invoke(&text).map_err(ActionError::Failed)?,
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum ActionError {
    /// The action list itself is wrong.
    Invalid(String),
    /// A command or task it ran failed.
    Failed(DeployError),
}

impl ActionError {
    pub fn into_message(self) -> String {
        match self {
            ActionError::Invalid(m) => m,
            ActionError::Failed(e) => e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
