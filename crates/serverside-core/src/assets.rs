//! Asset compilation: whether to compile, skip, or reuse the previous
//! release's assets, and how each reuse strategy lays files out.

use crate::config::{ConfigStore, PrecompileMode};
use crate::error::{DeployError, Result};
use crate::fleet::ServerFleet;
use crate::paths::{read_revision, ReleasePaths};
use crate::server::Role;
use crate::source::Source;
use crate::transport::{shell_quote, CommandSpec};
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `precompile_assets: false`.
    Disabled,
    /// No `config/application.rb` or `app/assets`: not an asset-bearing app.
    NotApplicable,
    /// `config.assets.enabled = false` in `config/application.rb`.
    DisabledByApplication,
    /// The app ships precompiled assets.
    PublicAssetsExist,
}

impl SkipReason {
    /// Status line, or `None` when skipping should be silent.
    pub fn message(self) -> Option<&'static str> {
        match self {
            SkipReason::Disabled => {
                Some("Skipping asset precompilation. (precompile_assets: false)")
            }
            SkipReason::NotApplicable => None,
            SkipReason::DisabledByApplication => {
                Some("Skipping asset precompilation. ('config/application.rb' disables assets.)")
            }
            SkipReason::PublicAssetsExist => {
                Some("Skipping asset precompilation. ('public/assets' directory already exists.)")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetDecision {
    /// `implicit` when compilation was inferred rather than asked for.
    Compile { implicit: bool },
    Skip(SkipReason),
    Reuse,
}

/// What the release looks like, as far as assets care.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppFacts {
    pub has_application_rb: bool,
    pub has_app_assets: bool,
    pub assets_disabled: bool,
    pub has_public_assets: bool,
}

impl AppFacts {
    pub fn inspect(paths: &ReleasePaths) -> Self {
        let application_rb = paths.in_release(&["config", "application.rb"]);
        let text = std::fs::read_to_string(&application_rb).ok();
        Self {
            has_application_rb: text.is_some(),
            has_app_assets: paths.in_release(&["app", "assets"]).is_dir(),
            assets_disabled: text.as_deref().is_some_and(app_disables_assets),
            has_public_assets: paths.public_assets().exists(),
        }
    }
}

static DISABLED_RE: OnceLock<Regex> = OnceLock::new();

/// An uncommented `config.assets.enabled = false` (or `nil`) line.
pub fn app_disables_assets(application_rb: &str) -> bool {
    let re = DISABLED_RE.get_or_init(|| {
        Regex::new(r"(?m)^[^#\n]*config\.assets\.enabled\s*=\s*(false|nil)").expect("static pattern")
    });
    re.is_match(application_rb)
}

/// Everything the decision depends on besides the release contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionInputs {
    pub mode: PrecompileMode,
    pub precompile_unchanged: bool,
    pub reusable: bool,
    pub previous_revision: Option<String>,
    pub active_revision: Option<String>,
}

/// Compile, skip or reuse. `unchanged` asks the source whether the asset
/// dependencies differ between two revisions; it is only called when reuse
/// is actually possible.
pub fn decide(
    inputs: &DecisionInputs,
    facts: &AppFacts,
    unchanged: impl FnOnce(&str, &str) -> Result<bool>,
) -> Result<AssetDecision> {
    match inputs.mode {
        PrecompileMode::Enabled => {
            if inputs.precompile_unchanged {
                return Ok(AssetDecision::Compile { implicit: false });
            }
            if let (true, Some(prev), Some(active)) = (
                inputs.reusable,
                inputs.previous_revision.as_deref(),
                inputs.active_revision.as_deref(),
            ) {
                if unchanged(prev, active)? {
                    return Ok(AssetDecision::Reuse);
                }
            }
            Ok(AssetDecision::Compile { implicit: false })
        }
        PrecompileMode::Disabled => Ok(AssetDecision::Skip(SkipReason::Disabled)),
        PrecompileMode::Detect => Ok(if !facts.has_application_rb || !facts.has_app_assets {
            AssetDecision::Skip(SkipReason::NotApplicable)
        } else if facts.assets_disabled {
            AssetDecision::Skip(SkipReason::DisabledByApplication)
        } else if facts.has_public_assets {
            AssetDecision::Skip(SkipReason::PublicAssetsExist)
        } else {
            AssetDecision::Compile { implicit: true }
        }),
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStrategy {
    /// Assets live in the release; reuse copies the previous release's.
    Private,
    /// `public/assets` links to `shared/assets`.
    Shared,
    /// Shared, emptied before each compile.
    Cleaning,
    /// Shared, with the previous build moved to `shared/last_assets`.
    Shifting,
}

impl AssetStrategy {
    pub fn all() -> &'static [AssetStrategy] {
        &[
            AssetStrategy::Private,
            AssetStrategy::Shared,
            AssetStrategy::Cleaning,
            AssetStrategy::Shifting,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssetStrategy::Private => "private",
            AssetStrategy::Shared => "shared",
            AssetStrategy::Cleaning => "cleaning",
            AssetStrategy::Shifting => "shifting",
        }
    }

    pub fn fetch(name: &str) -> Result<Self> {
        name.parse()
    }

    /// Whether there is a previous build to reuse: a non-empty
    /// `public/assets` in the previous release, or a non-empty
    /// `shared/assets` for the shared strategies.
    pub fn reusable(self, paths: &ReleasePaths, previous_release: Option<&Path>) -> bool {
        let dir = match self {
            AssetStrategy::Private => match previous_release {
                Some(prev) => prev.join("public").join("assets"),
                None => return false,
            },
            AssetStrategy::Shared | AssetStrategy::Cleaning | AssetStrategy::Shifting => {
                paths.shared_assets()
            }
        };
        std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
    }

    /// Commands that make the previous release's assets this release's.
    pub fn reuse_commands(self, paths: &ReleasePaths, previous_release: Option<&Path>) -> Vec<String> {
        let q = |p: &Path| shell_quote(&p.to_string_lossy());
        match self {
            AssetStrategy::Private => match previous_release {
                Some(prev) => vec![format!(
                    "mkdir -p {assets} && rsync -aq {}/ {assets}",
                    q(&prev.join("public").join("assets")),
                    assets = q(&paths.public_assets()),
                )],
                None => Vec::new(),
            },
            AssetStrategy::Shared | AssetStrategy::Cleaning | AssetStrategy::Shifting => {
                vec![format!(
                    "mkdir -p {shared} {public} && rm -rf {assets} && ln -nfs {shared} {assets}",
                    shared = q(&paths.shared_assets()),
                    public = q(&paths.public()),
                    assets = q(&paths.public_assets()),
                )]
            }
        }
    }

    /// Commands run before compiling.
    pub fn prepare_commands(self, paths: &ReleasePaths) -> Vec<String> {
        let q = |p: &Path| shell_quote(&p.to_string_lossy());
        let shared = q(&paths.shared_assets());
        let mut commands = match self {
            AssetStrategy::Private => return Vec::new(),
            AssetStrategy::Shared => Vec::new(),
            AssetStrategy::Cleaning => vec![format!(
                "mkdir -p {shared} && find {shared} -mindepth 1 -maxdepth 1 -exec rm -rf {{}} +"
            )],
            AssetStrategy::Shifting => {
                let last = q(&paths.shared_last_assets());
                vec![format!(
                    "rm -rf {last} && mkdir -p {shared} && mv {shared} {last} && mkdir -p {shared}"
                )]
            }
        };
        commands.extend(self.reuse_commands(paths, None));
        commands
    }
}

impl std::str::FromStr for AssetStrategy {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        AssetStrategy::all()
            .iter()
            .copied()
            .find(|st| st.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| DeployError::UnknownStrategy {
                kind: "asset strategy",
                name: s.to_string(),
            })
    }
}

impl fmt::Display for AssetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Running it
// ---------------------------------------------------------------------------

const IMPLICIT_COMPILE_WARNING: &str = "Assets were detected and precompiled for this application,
but asset precompile failures may be silently ignored in the future.

ACTION REQUIRED: Add or update config/ey.yml in your project to
ensure assets are compiled every deploy and halted on failure.

  precompile_assets: true  # precompile assets

This warning will continue until you update and commit config/ey.yml.";

/// The `compile_assets` step.
pub struct AssetCompiler<'a> {
    pub config: &'a ConfigStore,
    pub paths: &'a ReleasePaths,
    pub fleet: &'a ServerFleet,
    pub source: &'a dyn Source,
}

impl AssetCompiler<'_> {
    fn roles(&self) -> Vec<Role> {
        Role::parse_list(&self.config.asset_roles())
    }

    fn previous_release(&self) -> Result<Option<std::path::PathBuf>> {
        let releases = self.paths.list_releases()?;
        Ok(self.paths.previous_release_of_active(&releases).cloned())
    }

    pub fn decide(&self, strategy: AssetStrategy) -> Result<AssetDecision> {
        let previous = self.previous_release()?;
        let previous_revision = previous
            .as_ref()
            .and_then(|r| read_revision(&r.join(crate::paths::REVISION_FILE)));
        let inputs = DecisionInputs {
            mode: self.config.precompile_assets(),
            precompile_unchanged: self.config.precompile_unchanged_assets(),
            reusable: strategy.reusable(self.paths, previous.as_deref()),
            previous_revision,
            active_revision: read_revision(&self.paths.active_revision()),
        };
        let deps = self.config.asset_dependencies();
        decide(&inputs, &AppFacts::inspect(self.paths), |prev, active| {
            self.source.same_content(self.fleet, prev, active, &deps)
        })
    }

    pub fn run(&self) -> Result<AssetDecision> {
        // The strategy name is checked even when nothing gets compiled.
        let strategy = AssetStrategy::fetch(&self.config.asset_strategy())?;
        let decision = self.decide(strategy)?;
        let fleet = self.fleet.select(&self.roles());
        match decision {
            AssetDecision::Skip(reason) => {
                if let Some(message) = reason.message() {
                    info!("{message}");
                }
            }
            AssetDecision::Reuse => {
                info!("Reusing existing assets. (configured asset_dependencies unchanged)");
                let previous = self.previous_release()?;
                for command in strategy.reuse_commands(self.paths, previous.as_deref()) {
                    fleet.run(CommandSpec::new(command))?;
                }
            }
            AssetDecision::Compile { implicit: false } => {
                if self.config.precompile_unchanged_assets() {
                    info!("Precompiling assets without change detection. (precompile_unchanged_assets: true)");
                } else {
                    info!("Precompiling assets. (precompile_assets: true)");
                }
                self.compile(strategy, &fleet)?;
            }
            AssetDecision::Compile { implicit: true } => {
                info!("Precompiling assets. ('app/assets' exists, 'public/assets' not found, not disabled in config.)");
                match self.compile(strategy, &fleet) {
                    Ok(()) => warn!("{IMPLICIT_COMPILE_WARNING}"),
                    Err(e) => self.soft_failure(&e),
                }
            }
        }
        Ok(decision)
    }

    fn soft_failure(&self, err: &DeployError) {
        let task = self.config.precompile_assets_task();
        let missing_task = format!("Don't know how to build task '{task}'");
        let is_missing_task = match err {
            DeployError::Remote(failure) => failure.output_contains(&missing_task),
            other => other.to_string().contains(&missing_task),
        };
        if is_missing_task {
            warn!(
                "Asset precompilation detected but compilation failure ignored!\n\
                 Rake task '{task}' was not found.\n\n\
                 ACTION REQUIRED: Add precompile_assets option to ey.yml.\n  \
                 precompile_assets: false # disable assets to avoid this error."
            );
        } else {
            warn!(
                "Asset precompilation detected but compilation failed!\n{err}\n\n\
                 ACTION REQUIRED: Add precompile_assets option to ey.yml.\n  \
                 precompile_assets: true  # precompile assets when asset changes detected\n  \
                 precompile_assets: false # disable asset compilation."
            );
        }
    }

    fn compile_spec(&self) -> Result<CommandSpec> {
        let binstubs = shell_quote(&self.paths.binstubs().to_string_lossy());
        Ok(CommandSpec::new(format!(
            "PATH={binstubs}:$PATH {}",
            self.config.precompile_assets_command()
        ))
        .with_env(self.config.framework_envs()?)
        .in_dir(self.paths.active_release()))
    }

    fn compile(&self, strategy: AssetStrategy, fleet: &ServerFleet) -> Result<()> {
        for command in strategy.prepare_commands(self.paths) {
            fleet.run(CommandSpec::new(command))?;
        }
        let spec = self.compile_spec()?;
        if self.config.experimental_sync_assets() {
            info!("Compiling assets once on localhost (experimental_sync_assets: true)");
            fleet.run_local_strict(&spec)?;
            info!("Syncing assets to other remote servers (experimental_sync_assets: true)");
            fleet.sync_directory(&self.paths.public_assets(), false)?;
        } else {
            fleet.run(spec)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
