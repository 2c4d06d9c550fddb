//! Deploy and service hooks.
//!
//! At every checkpoint two directories are searched: the app's own
//! `<release>/deploy` and the environment-wide `shared/hooks`. Each yields at
//! most one hook per name: an interpreted `<name>.yml` action list, or an
//! executable file called `<name>`.

use crate::actions::{self, ActionEnv, ActionStep};
use crate::config::ConfigStore;
use crate::error::{DeployError, Result};
use crate::fleet::ServerFleet;
use crate::io;
use crate::paths::ReleasePaths;
use crate::server::Server;
use crate::transport::{render_env_prefix, shell_quote, CommandSpec};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// HookContext
// ---------------------------------------------------------------------------

/// Everything a hook is told about the deploy it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub app: String,
    pub environment_name: String,
    pub account_name: String,
    pub framework_env: String,
    pub release_path: PathBuf,
    pub current_roles: Vec<String>,
    pub current_name: Option<String>,
    pub verbose: bool,
}

impl HookContext {
    pub fn from_config(config: &ConfigStore, release_path: &Path) -> Result<Self> {
        Ok(Self {
            app: config.app()?,
            environment_name: config.environment_name()?,
            account_name: config.account_name()?,
            framework_env: config.framework_env()?,
            release_path: release_path.to_path_buf(),
            current_roles: config.current_roles(),
            current_name: config.current_name(),
            verbose: config.verbose(),
        })
    }

    /// The same context as seen from `server`.
    pub fn for_server(&self, server: &Server) -> Self {
        Self {
            current_roles: server.role_names(),
            current_name: server.name.clone(),
            ..self.clone()
        }
    }

    /// `EY_DEPLOY_CONFIG`: a JSON object with keys in a fixed order.
    pub fn config_json(&self, hook_name: &str) -> String {
        let mut map = Map::new();
        map.insert("app".into(), Value::from(self.app.clone()));
        map.insert("environment_name".into(), Value::from(self.environment_name.clone()));
        map.insert("account_name".into(), Value::from(self.account_name.clone()));
        map.insert("framework_env".into(), Value::from(self.framework_env.clone()));
        map.insert(
            "release_path".into(),
            Value::from(self.release_path.to_string_lossy().into_owned()),
        );
        map.insert("hook_name".into(), Value::from(hook_name));
        Value::Object(map).to_string()
    }

    /// The environment handed to executable hooks, in the order it is
    /// rendered.
    pub fn env(&self, hook_name: &str) -> Vec<(String, String)> {
        let mut env = vec![
            ("EY_DEPLOY_ACCOUNT_NAME".to_string(), self.account_name.clone()),
            ("EY_DEPLOY_APP".to_string(), self.app.clone()),
            ("EY_DEPLOY_CONFIG".to_string(), self.config_json(hook_name)),
            ("EY_DEPLOY_CURRENT_ROLES".to_string(), self.current_roles.join(" ")),
            ("EY_DEPLOY_ENVIRONMENT_NAME".to_string(), self.environment_name.clone()),
            ("EY_DEPLOY_FRAMEWORK_ENV".to_string(), self.framework_env.clone()),
            (
                "EY_DEPLOY_RELEASE_PATH".to_string(),
                self.release_path.to_string_lossy().into_owned(),
            ),
            (
                "EY_DEPLOY_VERBOSE".to_string(),
                if self.verbose { "1" } else { "0" }.to_string(),
            ),
        ];
        for name in ["RAILS_ENV", "RACK_ENV", "NODE_ENV", "MERB_ENV"] {
            env.push((name.to_string(), self.framework_env.clone()));
        }
        env
    }

    /// The command line an executable hook runs as, environment included.
    pub fn render_command(&self, hook_name: &str, path: &Path) -> String {
        format!(
            "{}{}",
            render_env_prefix(&self.env(hook_name)),
            shell_quote(&path.to_string_lossy())
        )
    }

    fn lookup(&self, hook_name: &str, key: &str) -> Option<String> {
        match key {
            "app" => Some(self.app.clone()),
            "environment_name" => Some(self.environment_name.clone()),
            "account_name" => Some(self.account_name.clone()),
            "framework_env" => Some(self.framework_env.clone()),
            "release_path" => Some(self.release_path.to_string_lossy().into_owned()),
            "hook_name" => Some(hook_name.to_string()),
            "current_roles" => Some(self.current_roles.join(" ")),
            "current_name" => Some(self.current_name.clone().unwrap_or_default()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Hook discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Interpreted,
    Executable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub name: String,
    pub path: PathBuf,
    pub kind: HookKind,
}

/// Look for hook `name` in `dir`. The `.yml` form wins over an executable.
pub fn discover(dir: &Path, name: &str) -> Option<Hook> {
    let interpreted = dir.join(format!("{name}.yml"));
    if interpreted.is_file() {
        return Some(Hook {
            name: name.to_string(),
            path: interpreted,
            kind: HookKind::Interpreted,
        });
    }
    let executable = dir.join(name);
    if io::is_executable(&executable) {
        return Some(Hook {
            name: name.to_string(),
            path: executable,
            kind: HookKind::Executable,
        });
    }
    if executable.is_file() {
        warn!(
            "Skipping possible deploy hook {} because it is not executable.",
            executable.display()
        );
    }
    None
}

// ---------------------------------------------------------------------------
// HookRunner
// ---------------------------------------------------------------------------

pub struct HookRunner {
    deploy_hooks: PathBuf,
    service_hooks: PathBuf,
    executed: RefCell<BTreeSet<String>>,
}

impl HookRunner {
    pub fn new(paths: &ReleasePaths) -> Self {
        Self {
            deploy_hooks: paths.deploy_hooks(),
            service_hooks: paths.shared_hooks(),
            executed: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn has_run(&self, name: &str) -> bool {
        self.executed.borrow().contains(name)
    }

    /// Hooks currently present for `name`, deploy hooks first. Looked up
    /// fresh on every call.
    pub fn find(&self, name: &str) -> Vec<Hook> {
        [&self.deploy_hooks, &self.service_hooks]
            .into_iter()
            .filter_map(|dir| discover(dir, name))
            .collect()
    }

    /// Run every hook for `name` against `fleet`. A name runs at most once;
    /// later calls are no-ops. Returns whether anything ran.
    pub fn run(
        &self,
        name: &str,
        ctx: &HookContext,
        fleet: &ServerFleet,
        config: &ConfigStore,
    ) -> Result<bool> {
        if self.has_run(name) {
            return Ok(false);
        }
        let hooks = self.find(name);
        self.executed.borrow_mut().insert(name.to_string());
        for hook in &hooks {
            info!("Executing {}", hook.path.display());
            let outcome = match hook.kind {
                HookKind::Interpreted => run_interpreted(hook, ctx, fleet, config),
                HookKind::Executable => run_executable(hook, ctx, fleet),
            };
            if let Err(e) = outcome {
                error!("{e}");
                return Err(e);
            }
        }
        Ok(!hooks.is_empty())
    }

    /// The `hook <name>` entry point: like [`HookRunner::run`], but says so
    /// when there is nothing to run.
    pub fn run_standalone(
        &self,
        name: &str,
        ctx: &HookContext,
        fleet: &ServerFleet,
        config: &ConfigStore,
    ) -> Result<()> {
        if !self.run(name, ctx, fleet, config)? {
            info!("No hook found for {name}. Skipping.");
        }
        Ok(())
    }
}

fn run_interpreted(
    hook: &Hook,
    ctx: &HookContext,
    fleet: &ServerFleet,
    config: &ConfigStore,
) -> Result<()> {
    let hook_error = |message: String| DeployError::Hook {
        path: hook.path.clone(),
        message,
    };
    let text = std::fs::read_to_string(&hook.path).map_err(|e| hook_error(e.to_string()))?;
    let steps: Vec<ActionStep> = if text.trim().is_empty() {
        Vec::new()
    } else {
        serde_yaml::from_str(&text).map_err(|e| hook_error(e.to_string()))?
    };

    let lookup = |key: &str| ctx.lookup(&hook.name, key).or_else(|| config.string(key));
    let action_env = ActionEnv {
        fleet,
        dir: Some(ctx.release_path.clone()),
        env: ctx.env(&hook.name),
        lookup: &lookup,
    };
    actions::execute(&steps, &action_env, &mut |task| {
        Err(DeployError::UnknownTask(format!(
            "{task} (task actions are only available in eydeploy.yml)"
        )))
    })
    .map_err(|e| hook_error(e.into_message()))
}

fn run_executable(hook: &Hook, ctx: &HookContext, fleet: &ServerFleet) -> Result<()> {
    let command = shell_quote(&hook.path.to_string_lossy());
    let results = fleet.run_for_each(|server| {
        let ctx = ctx.for_server(server);
        Some(
            CommandSpec::new(command.clone())
                .with_env(ctx.env(&hook.name))
                .in_dir(ctx.release_path.clone()),
        )
    });
    for result in &results {
        let out = result.output.output.trim_end();
        if !out.is_empty() {
            info!("{out}");
        }
    }
    crate::fleet::check_results(results).map_err(|e| DeployError::Hook {
        path: hook.path.clone(),
        message: e.to_string(),
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
