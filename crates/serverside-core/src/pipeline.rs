//! The deploy itself: fourteen steps in a fixed order, hooks around each,
//! and a per-step override chain that `eydeploy.yml` (or code) can wrap.

use crate::actions::{self, ActionEnv, ActionError, ActionStep};
use crate::assets::AssetCompiler;
use crate::config::{ConfigStore, Priority, Source as ConfigSource};
use crate::custom_tasks::{self, LoadedTasks};
use crate::dependencies;
use crate::error::{DeployError, Result};
use crate::fleet::ServerFleet;
use crate::hooks::{HookContext, HookRunner};
use crate::io::{first_existing, read_yaml_value};
use crate::maintenance::Maintenance;
use crate::paths::{read_revision, ReleasePaths, REVISION_FILE};
use crate::server::Role;
use crate::source::{source_for, Source};
use crate::transport::{shell_quote, CommandSpec};
use chrono::Utc;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    PushCode,
    CopyRepositoryCache,
    CreateRevisionFile,
    Bundle,
    SetupServices,
    SymlinkConfigs,
    CompileAssets,
    EnableMaintenancePage,
    Migrate,
    Symlink,
    Restart,
    DisableMaintenancePage,
    CleanupOldReleases,
    GcRepositoryCache,
}

impl Step {
    /// Every step, in the order a deploy runs them.
    pub fn all() -> &'static [Step] {
        &[
            Step::PushCode,
            Step::CopyRepositoryCache,
            Step::CreateRevisionFile,
            Step::Bundle,
            Step::SetupServices,
            Step::SymlinkConfigs,
            Step::CompileAssets,
            Step::EnableMaintenancePage,
            Step::Migrate,
            Step::Symlink,
            Step::Restart,
            Step::DisableMaintenancePage,
            Step::CleanupOldReleases,
            Step::GcRepositoryCache,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::PushCode => "push_code",
            Step::CopyRepositoryCache => "copy_repository_cache",
            Step::CreateRevisionFile => "create_revision_file",
            Step::Bundle => "bundle",
            Step::SetupServices => "setup_services",
            Step::SymlinkConfigs => "symlink_configs",
            Step::CompileAssets => "compile_assets",
            Step::EnableMaintenancePage => "enable_maintenance_page",
            Step::Migrate => "migrate",
            Step::Symlink => "symlink",
            Step::Restart => "restart",
            Step::DisableMaintenancePage => "disable_maintenance_page",
            Step::CleanupOldReleases => "cleanup_old_releases",
            Step::GcRepositoryCache => "gc_repository_cache",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Step {
    type Err = DeployError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Step::all()
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| DeployError::UnknownStep(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Override chain
// ---------------------------------------------------------------------------

/// The rest of a step's chain, ending in its default behavior.
pub type Next<'a> = &'a dyn Fn(&Deploy) -> Result<()>;

/// A wrapper around a step. It decides whether, and when, to call `next`.
pub type WrapFn = Rc<dyn Fn(&Deploy, &dyn Fn(&Deploy) -> Result<()>) -> Result<()>>;

#[derive(Clone, Default)]
pub struct StepRegistry {
    wrappers: HashMap<Step, Vec<WrapFn>>,
}

impl StepRegistry {
    /// Push a wrapper on top of `step`'s chain. The last one pushed runs
    /// outermost.
    pub fn wrap<F>(&mut self, step: Step, wrapper: F)
    where
        F: Fn(&Deploy, &dyn Fn(&Deploy) -> Result<()>) -> Result<()> + 'static,
    {
        self.wrappers.entry(step).or_default().push(Rc::new(wrapper));
    }

    pub fn is_wrapped(&self, step: Step) -> bool {
        self.wrappers.get(&step).is_some_and(|w| !w.is_empty())
    }

    fn call(&self, step: Step, deploy: &Deploy, base: Next<'_>) -> Result<()> {
        let chain = self.wrappers.get(&step).map(Vec::as_slice).unwrap_or(&[]);
        call_chain(chain, deploy, base)
    }
}

fn call_chain(chain: &[WrapFn], deploy: &Deploy, base: Next<'_>) -> Result<()> {
    match chain.split_last() {
        None => base(deploy),
        Some((outer, rest)) => outer(deploy, &|d: &Deploy| call_chain(rest, d, base)),
    }
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

pub struct Deploy {
    config: ConfigStore,
    paths: ReleasePaths,
    fleet: ServerFleet,
    hooks: HookRunner,
    registry: StepRegistry,
    custom_tasks: Option<Rc<LoadedTasks>>,
    task_stack: RefCell<Vec<String>>,
}

impl Deploy {
    /// Validates the configuration before anything touches a server.
    pub fn new(config: ConfigStore, fleet: ServerFleet) -> Result<Self> {
        config.validate()?;
        let paths = ReleasePaths::from_config(&config)?;
        Ok(Self {
            hooks: HookRunner::new(&paths),
            config,
            paths,
            fleet,
            registry: StepRegistry::default(),
            custom_tasks: None,
            task_stack: RefCell::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn paths(&self) -> &ReleasePaths {
        &self.paths
    }

    pub fn fleet(&self) -> &ServerFleet {
        &self.fleet
    }

    pub fn registry_mut(&mut self) -> &mut StepRegistry {
        &mut self.registry
    }

    fn set_paths(&mut self, paths: ReleasePaths) {
        self.hooks = HookRunner::new(&paths);
        self.paths = paths;
    }

    fn source(&self) -> Result<Box<dyn Source>> {
        source_for(&self.config, &self.paths)
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Refresh the repository cache, then deploy from it.
    pub fn deploy(&mut self) -> Result<()> {
        info!("Updating repository cache");
        self.source()?.update_repository_cache(&self.fleet)?;
        self.cached_deploy()
    }

    /// Deploy whatever is in the repository cache.
    pub fn cached_deploy(&mut self) -> Result<()> {
        info!(
            "Starting deploy at {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S %Z")
        );
        self.require_custom_tasks()?;
        self.load_ey_yml()?;
        self.run_pipeline()?;
        info!(
            "Finished deploy at {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S %Z")
        );
        Ok(())
    }

    /// Load `eydeploy.yml` from the repository cache, once, and wrap the
    /// steps it overrides.
    pub fn require_custom_tasks(&mut self) -> Result<()> {
        if self.custom_tasks.is_some() {
            return Ok(());
        }
        let Some(loaded) = custom_tasks::load(&self.config, self.paths.repository_cache())? else {
            return Ok(());
        };
        let loaded = Rc::new(loaded);
        for (step, _) in loaded.tasks.step_overrides() {
            let unit = Rc::clone(&loaded);
            self.registry.wrap(step, move |deploy, next| {
                let Some(o) = unit.tasks.steps.get(step.as_str()) else {
                    return next(deploy);
                };
                deploy.run_actions(&unit.path, &o.before)?;
                if !o.replace {
                    next(deploy)?;
                }
                deploy.run_actions(&unit.path, &o.after)
            });
        }
        self.custom_tasks = Some(loaded);
        Ok(())
    }

    fn load_ey_yml(&mut self) -> Result<()> {
        let cache = self.paths.repository_cache();
        let candidates = [cache.join("config").join("ey.yml"), cache.join("ey.yml")];
        let Some(path) = first_existing(&candidates) else {
            return Ok(());
        };
        if let Some(data) = read_yaml_value(&path)? {
            let environment = self.config.environment_name()?;
            self.config.load_ey_yml(&data, &environment);
        }
        Ok(())
    }

    /// `before_deploy`, the fourteen steps, `after_deploy`.
    pub fn run_pipeline(&self) -> Result<()> {
        self.callback("before_deploy")?;
        for step in Step::all() {
            self.run_step(*step)?;
        }
        self.callback("after_deploy")
    }

    /// One step with its `before_`/`after_` hooks and override chain.
    pub fn run_step(&self, step: Step) -> Result<()> {
        self.callback(&format!("before_{step}"))?;
        self.call_step(step)?;
        self.callback(&format!("after_{step}"))
    }

    fn call_step(&self, step: Step) -> Result<()> {
        self.registry
            .call(step, self, &|deploy: &Deploy| deploy.default_step(step))
    }

    /// Run a step or a task from `eydeploy.yml` by name.
    pub fn invoke(&self, name: &str) -> Result<()> {
        if self.task_stack.borrow().iter().any(|n| n == name) {
            return Err(DeployError::UnknownTask(format!(
                "{name} (invoked recursively: {} -> {name})",
                self.task_stack.borrow().join(" -> ")
            )));
        }
        self.task_stack.borrow_mut().push(name.to_string());
        let result = match name.parse::<Step>() {
            Ok(step) => self.run_step(step),
            Err(_) => match &self.custom_tasks {
                Some(unit) => match unit.tasks.task(name) {
                    Some(steps) => {
                        info!("Running task {name}");
                        self.run_actions(&unit.path, steps)
                    }
                    None => Err(DeployError::UnknownTask(name.to_string())),
                },
                None => Err(DeployError::UnknownTask(name.to_string())),
            },
        };
        self.task_stack.borrow_mut().pop();
        result
    }

    fn run_actions(&self, path: &Path, steps: &[ActionStep]) -> Result<()> {
        let release = self.paths.active_release().to_string_lossy().into_owned();
        let lookup = |key: &str| match key {
            "release_path" => Some(release.clone()),
            _ => self.config.string(key),
        };
        let env = ActionEnv {
            fleet: &self.fleet,
            dir: Some(self.paths.active_release().to_path_buf()),
            env: self.config.framework_envs()?,
            lookup: &lookup,
        };
        actions::execute(steps, &env, &mut |task: &str| self.invoke(task)).map_err(|e| match e {
            ActionError::Invalid(message) => DeployError::CustomTasks {
                path: path.to_path_buf(),
                message,
            },
            ActionError::Failed(e) => e,
        })
    }

    fn hook_context(&self) -> Result<HookContext> {
        HookContext::from_config(&self.config, self.paths.active_release())
    }

    fn callback(&self, name: &str) -> Result<()> {
        let ctx = self.hook_context()?;
        self.hooks.run(name, &ctx, &self.fleet, &self.config)?;
        Ok(())
    }

    /// Run one hook out of band, as `serverside hook <name>` does.
    pub fn run_hook(&self, name: &str) -> Result<()> {
        let ctx = self.hook_context()?;
        self.hooks.run_standalone(name, &ctx, &self.fleet, &self.config)
    }

    /// Switch back to the release before the latest and restart on it. The
    /// abandoned release is deleted.
    pub fn rollback(&mut self) -> Result<()> {
        let releases = self.paths.list_releases()?;
        let Some(view) = self.paths.rollback(&releases) else {
            return Err(DeployError::Rollback(
                "Already at oldest release, nothing to roll back to.".to_string(),
            ));
        };
        let abandoned = ReleasePaths::latest_release(&releases).cloned();
        info!("Rolling back to previous release: {}", view.active_release().display());
        self.set_paths(view);
        self.require_custom_tasks()?;

        self.run_step(Step::Symlink)?;
        if let Some(abandoned) = abandoned {
            info!("Removing abandoned release {}", abandoned.display());
            self.fleet.sudo(format!(
                "rm -rf {}",
                shell_quote(&abandoned.to_string_lossy())
            ))?;
        }
        self.restart_with_maintenance_page()?;
        info!("Finished rollback at {}", Utc::now().format("%Y-%m-%d %H:%M:%S %Z"));
        Ok(())
    }

    /// Restart only, with the maintenance page around it if configured.
    pub fn restart_with_maintenance_page(&self) -> Result<()> {
        let maintenance = Maintenance::new(&self.paths, &self.fleet);
        maintenance.conditionally_enable(&self.config)?;
        self.run_step(Step::Restart)?;
        maintenance.conditionally_disable(&self.config)
    }

    /// Make the release `current` points at the active release.
    pub fn use_current_release(&mut self) -> Result<()> {
        let current = self.current_release()?;
        let paths = ReleasePaths::new(
            self.paths.app_name(),
            Some(self.paths.deploy_root()),
            Some(&current),
            Some(self.paths.repository_cache()),
        );
        self.set_paths(paths);
        Ok(())
    }

    fn current_release(&self) -> Result<PathBuf> {
        std::fs::canonicalize(self.paths.current()).map_err(|_| {
            DeployError::NotDeployed(format!(
                "{} has no current release at {}",
                self.paths.app_name(),
                self.paths.current().display()
            ))
        })
    }

    /// Bring new servers up to date with this one: normalize ownership,
    /// copy the app directory to every remote server, then redeploy the
    /// current release with a clean bundle.
    pub fn integrate(&mut self, ignore_existing: bool) -> Result<()> {
        let current = self.current_release()?;
        let mut overrides = ConfigSource::new();
        overrides.insert(
            "release_path".to_string(),
            Value::String(current.to_string_lossy().into_owned()),
        );
        if let Some(revision) = read_revision(&current.join(REVISION_FILE)) {
            overrides.insert("branch".to_string(), Value::String(revision));
        }
        overrides.insert("clean".to_string(), Value::Bool(true));
        self.config.append_source(overrides, Priority::High);
        self.set_paths(ReleasePaths::from_config(&self.config)?);

        let app_dir = shell_quote(&self.paths.deploy_root().to_string_lossy());
        let owner = format!("{}:{}", self.config.user(), self.config.group());
        let chown = format!("chown -R {owner} {app_dir}");
        info!("Ensuring {owner} owns {app_dir}");
        self.fleet.run_local_strict(&CommandSpec::sudo(chown.clone()))?;

        let deploy_root = self.paths.deploy_root().to_path_buf();
        let current_link = shell_quote(&self.paths.current().to_string_lossy());
        let ssh = self.fleet.ssh().clone();
        self.fleet.remote().run_for_each_from_local(|server| {
            info!("Integrating {server}");
            let mkdir = ssh.remote_command(server, &format!("mkdir -p {app_dir}"), false);
            let sync = ssh.sync_command(server, &deploy_root, ignore_existing);
            let unlink = ssh.remote_command(server, &format!("rm -rf {current_link}"), false);
            Some(CommandSpec::new(format!(
                "({}) && ({mkdir} && {sync}) && ({unlink})",
                ssh.remote_command(server, &chown, true)
            )))
        })?;

        self.cached_deploy()
    }

    // -----------------------------------------------------------------------
    // Default step behavior
    // -----------------------------------------------------------------------

    fn default_step(&self, step: Step) -> Result<()> {
        match step {
            Step::PushCode => self.push_code(),
            Step::CopyRepositoryCache => self.copy_repository_cache(),
            Step::CreateRevisionFile => self.create_revision_file(),
            Step::Bundle => self.bundle(),
            Step::SetupServices => self.setup_services(),
            Step::SymlinkConfigs => self.symlink_configs(),
            Step::CompileAssets => self.compile_assets(),
            Step::EnableMaintenancePage => {
                Maintenance::new(&self.paths, &self.fleet).conditionally_enable(&self.config)
            }
            Step::Migrate => self.migrate(),
            Step::Symlink => self.symlink(),
            Step::Restart => self.restart(),
            Step::DisableMaintenancePage => {
                Maintenance::new(&self.paths, &self.fleet).conditionally_disable(&self.config)
            }
            Step::CleanupOldReleases => self.cleanup_old_releases(),
            Step::GcRepositoryCache => self.gc_repository_cache(),
        }
    }

    fn q(path: &Path) -> String {
        shell_quote(&path.to_string_lossy())
    }

    fn push_code(&self) -> Result<()> {
        info!("Pushing code to all servers");
        self.fleet.sync_directory(self.paths.repository_cache(), false)
    }

    fn copy_repository_cache(&self) -> Result<()> {
        let release = Self::q(self.paths.active_release());
        info!("Copying to {}", self.paths.active_release().display());
        let dirs = [
            self.paths.releases(),
            self.paths.shared_config(),
            self.paths.shared_log(),
            self.paths.shared_pids(),
            self.paths.shared_system(),
            self.paths.shared_tmp(),
        ]
        .iter()
        .map(|p| Self::q(p))
        .collect::<Vec<_>>()
        .join(" ");
        let mut rsync = String::from("rsync -aq --exclude .git");
        for pattern in self.config.copy_exclude() {
            rsync.push_str(" --exclude ");
            rsync.push_str(&shell_quote(&pattern));
        }
        self.fleet.run(CommandSpec::new(format!(
            "mkdir -p {release} {dirs} && {rsync} {}/ {release}",
            Self::q(self.paths.repository_cache())
        )))?;
        self.fleet.sudo(format!(
            "chown -R {}:{} {release}",
            self.config.user(),
            self.config.group()
        ))?;
        Ok(())
    }

    fn create_revision_file(&self) -> Result<()> {
        let command = self
            .source()?
            .create_revision_file_command(&self.fleet, self.paths.active_release())?;
        self.fleet.run(CommandSpec::new(command))?;
        Ok(())
    }

    fn bundle(&self) -> Result<()> {
        for manager in dependencies::detect(&self.config, self.paths.active_release()) {
            info!("Installing dependencies with {manager}");
            for command in manager.install_commands(&self.config, &self.paths) {
                self.fleet.run(CommandSpec::new(command))?;
            }
        }
        Ok(())
    }

    fn setup_services(&self) -> Result<()> {
        let check = CommandSpec::new(self.config.services_check_command());
        if !self.fleet.run_local(&check)?.success {
            return Ok(());
        }
        info!("Setting up external services.");
        let setup = self.config.services_setup_command()?;
        if let Err(e) = self.fleet.run(CommandSpec::new(setup)) {
            warn!(
                "External services setup failed; the deploy continues.\n{e}\n\
                 Service configuration in shared/config may be missing or stale."
            );
        }
        Ok(())
    }

    fn symlink_configs(&self) -> Result<()> {
        info!("Symlinking configs.");
        let release = Self::q(self.paths.active_release());
        let mut commands = vec![
            format!("rm -rf {release}/log {release}/public/system {release}/tmp/pids"),
            format!("mkdir -p {release}/tmp {release}/public {release}/config"),
        ];
        if self.config.shared_tmp() {
            commands.push(format!(
                "rm -rf {release}/tmp && ln -nfs {} {release}/tmp",
                Self::q(&self.paths.shared_tmp())
            ));
        }
        commands.extend([
            format!("ln -nfs {} {release}/log", Self::q(&self.paths.shared_log())),
            format!(
                "ln -nfs {} {release}/public/system",
                Self::q(&self.paths.shared_system())
            ),
            format!("ln -nfs {} {release}/tmp/pids", Self::q(&self.paths.shared_pids())),
            format!(
                "find {} -maxdepth 1 -type f -exec ln -nfs {{}} {release}/config/ \\;",
                Self::q(&self.paths.shared_config())
            ),
        ]);
        self.fleet.run(CommandSpec::new(commands.join(" && ")))?;
        Ok(())
    }

    fn compile_assets(&self) -> Result<()> {
        let source = self.source()?;
        AssetCompiler {
            config: &self.config,
            paths: &self.paths,
            fleet: &self.fleet,
            source: source.as_ref(),
        }
        .run()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let Some(migrate) = self.config.migrate() else {
            return Ok(());
        };
        info!("Migrating: {migrate}");
        let binstubs = Self::q(&self.paths.binstubs());
        let spec = CommandSpec::new(format!("PATH={binstubs}:$PATH {migrate}"))
            .with_env(self.config.framework_envs()?)
            .in_dir(self.paths.active_release());
        self.fleet
            .with_roles(&[Role::AppMaster, Role::Solo], |fleet| fleet.run(spec))?;
        Ok(())
    }

    fn symlink(&self) -> Result<()> {
        info!("Symlinking code.");
        let current = self.paths.current();
        let staged = current.with_file_name(format!("{}.tmp", crate::paths::CURRENT_LINK));
        self.fleet.run(CommandSpec::new(format!(
            "ln -nfs {} {staged} && mv -T {staged} {current}",
            Self::q(self.paths.active_release()),
            staged = Self::q(&staged),
            current = Self::q(&current),
        )))?;
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        let command = self.config.restart_command()?;
        let app_servers = self.fleet.select(&Role::app_roles());
        for batch in app_servers.batches(self.config.restart_groups()?) {
            info!("Restarting app servers: {}", batch.hostnames().join(", "));
            batch.run(CommandSpec::new(command.clone()).in_dir(self.paths.current()))?;
        }
        Ok(())
    }

    fn cleanup_old_releases(&self) -> Result<()> {
        let keep = self.config.keep_releases()?;
        info!("Cleaning release directory, keeping the {keep} newest releases");
        let releases = Self::q(&self.paths.releases());
        self.fleet.sudo(format!(
            "ls -r {releases} | tail -n +{} | xargs -I@ rm -rf {releases}/@",
            keep + 1
        ))?;
        Ok(())
    }

    fn gc_repository_cache(&self) -> Result<()> {
        if !self.config.gc() {
            return Ok(());
        }
        info!("Garbage collecting the repository cache to reduce disk usage.");
        self.source()?.gc_repository_cache(&self.fleet)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
