//! Layered deploy configuration.
//!
//! A [`ConfigStore`] is a stack of key/value sources merged into one view.
//! Command-line options sit on top, the `--config` JSON blob below them, and
//! `config/ey.yml` sections are slotted underneath both once the repository
//! has been fetched. Every lookup goes through the merged view.

use crate::error::{DeployError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub type Source = Map<String, Value>;

pub const DEFAULT_KEEP_RELEASES: usize = 3;
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

const FRAMEWORK_ENV_NAMES: [&str; 4] = ["RAILS_ENV", "RACK_ENV", "NODE_ENV", "MERB_ENV"];
const DOWNTIME_STACKS: [&str; 2] = ["nginx_mongrel", "glassfish"];
const DEPRECATED_KEYS: [(&str, &str); 2] = [("repo", "git"), ("strategy", "source_class")];

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Where a newly appended source lands in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Above every existing source.
    High,
    /// Below every existing source.
    Low,
}

// ---------------------------------------------------------------------------
// PrecompileMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecompileMode {
    Enabled,
    Disabled,
    Detect,
}

// ---------------------------------------------------------------------------
// Option definition macros
// ---------------------------------------------------------------------------

macro_rules! required_options {
    ($($name:ident => $key:literal),* $(,)?) => {
        $(
            pub fn $name(&self) -> Result<String> {
                self.required($key)
            }
        )*
    };
}

macro_rules! string_options {
    ($($name:ident => $key:literal, $default:expr);* $(;)?) => {
        $(
            pub fn $name(&self) -> String {
                self.string($key).unwrap_or_else(|| $default.to_string())
            }
        )*
    };
}

macro_rules! boolean_options {
    ($($name:ident => $key:literal, $default:expr);* $(;)?) => {
        $(
            pub fn $name(&self) -> bool {
                self.boolean($key, $default)
            }
        )*
    };
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    /// Highest priority first.
    sources: Vec<Source>,
    merged: Source,
    deprecations: BTreeSet<String>,
}

impl ConfigStore {
    /// Build from command-line options (high priority) and the optional
    /// `--config` JSON blob (lower priority).
    pub fn new(options: Source, config_json: Option<&str>) -> Result<Self> {
        let config = match config_json.map(str::trim) {
            None | Some("") => Source::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw)? {
                Value::Object(map) => map,
                other => {
                    return Err(DeployError::InvalidConfig {
                        key: "config".to_string(),
                        message: format!("expected a JSON object, got {other}"),
                    })
                }
            },
        };
        let mut store = Self::default();
        store.append_source(options, Priority::High);
        store.append_source(config, Priority::Low);
        Ok(store)
    }

    pub fn from_source(source: Source) -> Self {
        let mut store = Self::default();
        store.append_source(source, Priority::High);
        store
    }

    pub fn append_source(&mut self, source: Source, priority: Priority) {
        match priority {
            Priority::High => self.sources.insert(0, source),
            Priority::Low => self.sources.push(source),
        }
        self.reload();
    }

    fn reload(&mut self) {
        let mut merged = Source::new();
        for source in self.sources.iter().rev() {
            for (k, v) in source {
                merged.insert(k.clone(), v.clone());
            }
        }
        self.merged = merged;

        for (key, replacement) in DEPRECATED_KEYS {
            if self.contains(key) && self.deprecations.insert(key.to_string()) {
                warn!("The configuration key '{key}' is deprecated in favor of '{replacement}'.");
            }
        }
    }

    /// The whole merged view.
    pub fn merged(&self) -> &Source {
        &self.merged
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.merged)?)
    }

    // -----------------------------------------------------------------------
    // Raw lookups
    // -----------------------------------------------------------------------

    /// Catch-all lookup for keys without a typed accessor. `null` counts as
    /// absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.merged.get(key).filter(|v| !v.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn fetch(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| DeployError::MissingConfig(key.to_string()))
    }

    /// Scalar value rendered as a string.
    pub fn string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(scalar_to_string)
    }

    pub fn required(&self, key: &str) -> Result<String> {
        self.string(key)
            .ok_or_else(|| DeployError::MissingConfig(key.to_string()))
    }

    /// A list value. Strings are split on commas and whitespace, which is how
    /// list options arrive from the command line.
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(value_to_list)
    }

    /// The default applies only to a missing key; a stored `null` is false.
    pub fn boolean(&self, key: &str, default: bool) -> bool {
        match self.merged.get(key) {
            None => default,
            Some(v) => truthy(Some(v)),
        }
    }

    pub fn number(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) => n.as_u64().map(|n| n as usize).ok_or_else(|| {
                DeployError::InvalidConfig {
                    key: key.to_string(),
                    message: format!("expected a non-negative integer, got {n}"),
                }
            }),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| DeployError::InvalidConfig {
                key: key.to_string(),
                message: format!("expected a non-negative integer, got {s:?}"),
            }),
            Some(other) => Err(DeployError::InvalidConfig {
                key: key.to_string(),
                message: format!("expected a non-negative integer, got {other}"),
            }),
        }
    }

    fn string_with_deprecated(&self, key: &str, deprecated: &str) -> Option<String> {
        self.string(key).or_else(|| self.string(deprecated))
    }

    // -----------------------------------------------------------------------
    // Typed options
    // -----------------------------------------------------------------------

    required_options! {
        app => "app",
        environment_name => "environment_name",
        account_name => "account_name",
        framework_env => "framework_env",
    }

    string_options! {
        precompile_assets_task => "precompile_assets_task", "assets:precompile";
        asset_strategy => "asset_strategy", "shifting";
        deployed_by => "deployed_by", "Automation (User name not available)";
        bundler => "bundler", "detect";
        npm => "npm", "detect";
        composer => "composer", "detect";
        services_check_command => "services_check_command",
            "which /usr/local/ey_resin/ruby/bin/ey-services-setup >/dev/null 2>&1";
    }

    boolean_options! {
        clean => "clean", false;
        verbose => "verbose", false;
        gc => "gc", false;
        precompile_unchanged_assets => "precompile_unchanged_assets", false;
        experimental_sync_assets => "experimental_sync_assets", false;
        shared_tmp => "shared_tmp", true;
        eydeploy_rb => "eydeploy_rb", true;
        maintenance_on_migrate => "maintenance_on_migrate", true;
    }

    pub fn maintenance_on_restart(&self) -> bool {
        self.boolean("maintenance_on_restart", self.required_downtime_stack())
    }

    pub fn git(&self) -> Option<String> {
        self.string_with_deprecated("git", "repo")
    }

    pub fn archive(&self) -> Option<String> {
        self.string("archive")
    }

    pub fn source_class(&self) -> Option<String> {
        self.string_with_deprecated("source_class", "strategy")
    }

    /// The migration command, if any.
    pub fn migrate(&self) -> Option<String> {
        self.string("migrate").filter(|m| !m.trim().is_empty())
    }

    pub fn is_migrate(&self) -> bool {
        self.migrate().is_some()
    }

    pub fn stack(&self) -> Option<String> {
        self.string("stack")
    }

    /// Branch, tag or SHA to deploy. `ref` is accepted as an alias.
    pub fn branch(&self) -> String {
        self.string("branch")
            .or_else(|| self.string("ref"))
            .unwrap_or_else(|| "master".to_string())
    }

    pub fn input_ref(&self) -> String {
        self.string("input_ref").unwrap_or_else(|| self.branch())
    }

    pub fn precompile_assets_command(&self) -> String {
        self.string("precompile_assets_command").unwrap_or_else(|| {
            format!(
                "rake {} RAILS_GROUPS=assets",
                self.precompile_assets_task()
            )
        })
    }

    pub fn precompile_assets(&self) -> PrecompileMode {
        match self.get("precompile_assets") {
            Some(Value::Bool(true)) => PrecompileMode::Enabled,
            Some(Value::Bool(false)) => PrecompileMode::Disabled,
            Some(Value::String(s)) if s == "true" => PrecompileMode::Enabled,
            Some(Value::String(s)) if s == "false" => PrecompileMode::Disabled,
            _ => PrecompileMode::Detect,
        }
    }

    pub fn asset_dependencies(&self) -> Vec<String> {
        self.list("asset_dependencies").unwrap_or_else(|| {
            [
                "app/assets",
                "lib/assets",
                "vendor/assets",
                "Gemfile.lock",
                "config/routes.rb",
                "config/application.rb",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect()
        })
    }

    pub fn asset_roles(&self) -> Vec<String> {
        self.list("asset_roles").unwrap_or_else(|| {
            ["app_master", "app", "solo"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }

    pub fn current_roles(&self) -> Vec<String> {
        self.list("current_roles").unwrap_or_default()
    }

    pub fn current_name(&self) -> Option<String> {
        self.string("current_name")
    }

    pub fn copy_exclude(&self) -> Vec<String> {
        self.list("copy_exclude").unwrap_or_default()
    }

    pub fn bundle_options(&self) -> Option<String> {
        self.string("bundle_options")
    }

    /// Bundler groups to leave out: `test` and `development`, minus whatever
    /// the app is being deployed as.
    pub fn bundle_without(&self) -> Vec<String> {
        if let Some(list) = self.list("bundle_without") {
            return list;
        }
        let env = self.string("framework_env");
        ["test", "development"]
            .iter()
            .filter(|g| env.as_deref() != Some(**g))
            .map(|g| g.to_string())
            .collect()
    }

    pub fn extra_bundle_install_options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        let without = self.bundle_without();
        if !without.is_empty() {
            opts.push("--without".to_string());
            opts.push(without.join(" "));
        }
        if let Some(extra) = self.bundle_options() {
            opts.push(extra);
        }
        opts
    }

    pub fn user(&self) -> String {
        self.string("user")
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "deploy".to_string())
    }

    pub fn group(&self) -> String {
        self.string("group").unwrap_or_else(|| self.user())
    }

    pub fn services_setup_command(&self) -> Result<String> {
        match self.string("services_setup_command") {
            Some(cmd) => Ok(cmd),
            None => Ok(format!(
                "/usr/local/ey_resin/ruby/bin/ey-services-setup {}",
                self.app()?
            )),
        }
    }

    pub fn restart_command(&self) -> Result<String> {
        match self.string("restart_command") {
            Some(cmd) => Ok(cmd),
            None => Ok(format!("/engineyard/bin/app_{} deploy", self.app()?)),
        }
    }

    pub fn keep_releases(&self) -> Result<usize> {
        self.number("keep_releases", DEFAULT_KEEP_RELEASES)
    }

    pub fn restart_groups(&self) -> Result<usize> {
        Ok(self.number("restart_groups", 1)?.max(1))
    }

    pub fn max_connections(&self) -> Result<usize> {
        Ok(self
            .number("max_connections", DEFAULT_MAX_CONNECTIONS)?
            .max(1))
    }

    // -----------------------------------------------------------------------
    // Derived predicates
    // -----------------------------------------------------------------------

    /// Stacks that cannot restart without dropping requests. An unknown stack
    /// is assumed to need downtime.
    pub fn required_downtime_stack(&self) -> bool {
        match self.stack() {
            None => true,
            Some(stack) => DOWNTIME_STACKS.contains(&stack.as_str()),
        }
    }

    pub fn framework_env_names(&self) -> &'static [&'static str] {
        &FRAMEWORK_ENV_NAMES
    }

    /// `RAILS_ENV`, `RACK_ENV`, `NODE_ENV` and `MERB_ENV`, all set to the
    /// framework env.
    pub fn framework_envs(&self) -> Result<Vec<(String, String)>> {
        let env = self.framework_env()?;
        Ok(FRAMEWORK_ENV_NAMES
            .iter()
            .map(|name| (name.to_string(), env.clone()))
            .collect())
    }

    /// Fails when more than one source selector is set. Called before any
    /// server work begins.
    pub fn validate(&self) -> Result<()> {
        if self.git().is_some() && self.archive().is_some() {
            return Err(DeployError::ConflictingSources);
        }
        self.keep_releases()?;
        self.restart_groups()?;
        self.max_connections()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ey.yml
    // -----------------------------------------------------------------------

    /// Slot the project's `ey.yml` underneath the existing sources: the
    /// section for `environment_name` first, then `defaults` below it.
    /// Returns true if either section was found.
    pub fn load_ey_yml(&mut self, data: &Value, environment_name: &str) -> bool {
        let mut loaded = false;

        let env_section = data
            .get("environments")
            .and_then(|envs| envs.get(environment_name))
            .and_then(Value::as_object);
        if let Some(section) = env_section {
            info!("ey.yml configuration loaded for environment {environment_name:?}.");
            let rendered = Value::Object(section.clone());
            debug!("{environment_name}: {rendered}");
            self.append_source(section.clone(), Priority::Low);
            loaded = true;
        }

        if let Some(defaults) = data.get("defaults").and_then(Value::as_object) {
            info!("ey.yml configuration loaded.");
            let rendered = Value::Object(defaults.clone());
            debug!("defaults: {rendered}");
            self.append_source(defaults.clone(), Priority::Low);
            loaded = true;
        }

        if !loaded {
            info!("No matching ey.yml configuration found for environment {environment_name:?}.");
        }
        loaded
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Boolean coercion: absent, `false`, `null`, `"false"` and `"nil"` are
/// false. Everything else, including `"0"`, is true.
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => s != "false" && s != "nil",
        Some(_) => true,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_to_string).collect(),
        Value::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        other => scalar_to_string(other).into_iter().collect(),
    }
}

/// Turn a `serde_json::json!` object literal into a [`Source`].
pub fn source_from(value: Value) -> Source {
    match value {
        Value::Object(map) => map,
        _ => Source::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(value: Value) -> ConfigStore {
        ConfigStore::from_source(source_from(value))
    }

    #[test]
    fn required_option_missing_fails() {
        let cfg = store(json!({}));
        let err = cfg.app().unwrap_err();
        assert!(matches!(err, DeployError::MissingConfig(ref k) if k == "app"));
    }

    #[test]
    fn required_option_found_in_any_source() {
        let mut cfg = store(json!({"verbose": true}));
        cfg.append_source(source_from(json!({"app": "myapp"})), Priority::Low);
        assert_eq!(cfg.app().unwrap(), "myapp");
    }

    #[test]
    fn cli_options_beat_config_json() {
        let cfg = ConfigStore::new(
            source_from(json!({"app": "from-cli"})),
            Some(r#"{"app": "from-json", "stack": "nginx_passenger"}"#),
        )
        .unwrap();
        assert_eq!(cfg.app().unwrap(), "from-cli");
        assert_eq!(cfg.stack().as_deref(), Some("nginx_passenger"));
    }

    #[test]
    fn config_json_must_be_an_object() {
        let err = ConfigStore::new(Source::new(), Some("[1,2]")).unwrap_err();
        assert!(matches!(err, DeployError::InvalidConfig { .. }));
    }

    #[test]
    fn boolean_coercion() {
        let cfg = store(json!({
            "a": "false", "b": "nil", "c": null, "d": false,
            "e": "0", "f": "true", "g": 0,
        }));
        assert!(!cfg.boolean("a", true));
        assert!(!cfg.boolean("b", true));
        assert!(!cfg.boolean("c", true));
        assert!(!cfg.boolean("d", true));
        assert!(cfg.boolean("e", false));
        assert!(cfg.boolean("f", false));
        assert!(cfg.boolean("g", false));
        assert!(!cfg.boolean("missing", false));
        assert!(!truthy(Some(&json!("false"))));
        assert!(truthy(Some(&json!("0"))));
    }

    #[test]
    fn appending_never_drops_unrelated_keys() {
        let mut cfg = store(json!({"app": "a", "branch": "main"}));
        cfg.append_source(source_from(json!({"branch": "next", "gc": true})), Priority::High);
        assert_eq!(cfg.app().unwrap(), "a");
        assert_eq!(cfg.branch(), "next");
        assert!(cfg.gc());

        cfg.append_source(source_from(json!({"app": "low", "stack": "x"})), Priority::Low);
        assert_eq!(cfg.app().unwrap(), "a", "low priority source must not win");
        assert_eq!(cfg.stack().as_deref(), Some("x"));
    }

    #[test]
    fn bundle_without_excludes_framework_env() {
        let cfg = store(json!({"framework_env": "development"}));
        assert_eq!(cfg.bundle_without(), vec!["test".to_string()]);
        let cfg = store(json!({"framework_env": "production"}));
        assert_eq!(cfg.bundle_without(), vec!["test", "development"]);
        assert_eq!(
            cfg.extra_bundle_install_options(),
            vec!["--without".to_string(), "test development".to_string()]
        );
    }

    #[test]
    fn computed_defaults() {
        let cfg = store(json!({"app": "shop", "user": "deploy"}));
        assert_eq!(cfg.group(), "deploy");
        assert_eq!(cfg.branch(), "master");
        assert_eq!(cfg.input_ref(), "master");
        assert_eq!(
            cfg.precompile_assets_command(),
            "rake assets:precompile RAILS_GROUPS=assets"
        );
        assert_eq!(cfg.restart_command().unwrap(), "/engineyard/bin/app_shop deploy");
        assert_eq!(cfg.keep_releases().unwrap(), DEFAULT_KEEP_RELEASES);
        assert_eq!(cfg.precompile_assets(), PrecompileMode::Detect);
        assert!(cfg.eydeploy_rb());
        assert!(cfg.shared_tmp());
    }

    #[test]
    fn ref_is_an_alias_for_branch() {
        let cfg = store(json!({"ref": "v1.2"}));
        assert_eq!(cfg.branch(), "v1.2");
    }

    #[test]
    fn precompile_modes() {
        assert_eq!(store(json!({"precompile_assets": true})).precompile_assets(), PrecompileMode::Enabled);
        assert_eq!(store(json!({"precompile_assets": "true"})).precompile_assets(), PrecompileMode::Enabled);
        assert_eq!(store(json!({"precompile_assets": "false"})).precompile_assets(), PrecompileMode::Disabled);
        assert_eq!(store(json!({"precompile_assets": "detect"})).precompile_assets(), PrecompileMode::Detect);
    }

    #[test]
    fn maintenance_on_restart_follows_stack() {
        assert!(store(json!({})).maintenance_on_restart());
        assert!(store(json!({"stack": "glassfish"})).maintenance_on_restart());
        assert!(!store(json!({"stack": "nginx_passenger"})).maintenance_on_restart());
        assert!(store(json!({"stack": "nginx_unicorn", "maintenance_on_restart": "true"})).maintenance_on_restart());
    }

    #[test]
    fn git_and_archive_conflict() {
        let cfg = store(json!({"git": "git@host:app.git", "archive": "https://x/app.zip"}));
        assert!(matches!(cfg.validate(), Err(DeployError::ConflictingSources)));
    }

    #[test]
    fn deprecated_repo_key_still_resolves() {
        let cfg = store(json!({"repo": "git@host:app.git"}));
        assert_eq!(cfg.git().as_deref(), Some("git@host:app.git"));
    }

    #[test]
    fn deprecations_are_recorded_once_per_key() {
        let mut cfg = store(json!({"repo": "git@host:app.git"}));
        cfg.append_source(source_from(json!({"keep_releases": 5})), Priority::Low);
        cfg.append_source(source_from(json!({"repo": "git@host:other.git"})), Priority::Low);
        assert_eq!(cfg.deprecations.len(), 1);
        assert!(cfg.deprecations.contains("repo"));
    }

    #[test]
    fn null_boolean_options_are_false() {
        let cfg = store(json!({"eydeploy_rb": null, "maintenance_on_migrate": null}));
        assert!(!cfg.eydeploy_rb());
        assert!(!cfg.maintenance_on_migrate());
        assert!(store(json!({})).eydeploy_rb());
    }

    #[test]
    fn list_options_accept_strings() {
        let cfg = store(json!({"asset_roles": "app_master, util", "copy_exclude": ["tmp", "log"]}));
        assert_eq!(cfg.asset_roles(), vec!["app_master", "util"]);
        assert_eq!(cfg.copy_exclude(), vec!["tmp", "log"]);
    }

    #[test]
    fn keep_releases_rejects_garbage() {
        let cfg = store(json!({"keep_releases": "lots"}));
        assert!(cfg.keep_releases().is_err());
        assert!(cfg.validate().is_err());
        let cfg = store(json!({"keep_releases": "5"}));
        assert_eq!(cfg.keep_releases().unwrap(), 5);
    }

    #[test]
    fn ey_yml_environment_beats_defaults_but_not_cli() {
        let mut cfg = ConfigStore::new(
            source_from(json!({"environment_name": "prod", "migrate": "rake db:migrate"})),
            None,
        )
        .unwrap();
        let data = json!({
            "defaults": {"precompile_assets": false, "keep_releases": 9, "migrate": "nope"},
            "environments": {"prod": {"precompile_assets": true}},
        });
        assert!(cfg.load_ey_yml(&data, "prod"));
        assert_eq!(cfg.precompile_assets(), PrecompileMode::Enabled);
        assert_eq!(cfg.keep_releases().unwrap(), 9);
        assert_eq!(cfg.migrate().as_deref(), Some("rake db:migrate"));
    }

    #[test]
    fn ey_yml_without_matching_sections() {
        let mut cfg = store(json!({}));
        let data = json!({"environments": {"staging": {"gc": true}}});
        assert!(!cfg.load_ey_yml(&data, "prod"));
        assert!(!cfg.gc());
    }

    #[test]
    fn framework_envs_mirror_framework_env() {
        let cfg = store(json!({"framework_env": "staging"}));
        let envs = cfg.framework_envs().unwrap();
        let names: Vec<&str> = envs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["RAILS_ENV", "RACK_ENV", "NODE_ENV", "MERB_ENV"]);
        assert!(envs.iter().all(|(_, v)| v == "staging"));
    }
}
