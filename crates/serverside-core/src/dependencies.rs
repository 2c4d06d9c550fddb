use crate::config::{truthy, ConfigStore};
use crate::paths::ReleasePaths;
use crate::transport::shell_quote;
use serde_json::Value;
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// DependencyManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyManager {
    Bundler,
    Npm,
    Composer,
}

impl DependencyManager {
    pub fn all() -> &'static [DependencyManager] {
        &[
            DependencyManager::Bundler,
            DependencyManager::Npm,
            DependencyManager::Composer,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyManager::Bundler => "bundler",
            DependencyManager::Npm => "npm",
            DependencyManager::Composer => "composer",
        }
    }

    /// The manifest whose presence in the release means "use me".
    pub fn manifest(self) -> &'static str {
        match self {
            DependencyManager::Bundler => "Gemfile",
            DependencyManager::Npm => "package.json",
            DependencyManager::Composer => "composer.json",
        }
    }

    /// Configured on or off explicitly, or detected from the release.
    pub fn enabled(self, config: &ConfigStore, release: &Path) -> bool {
        match config.get(self.as_str()) {
            None => release.join(self.manifest()).is_file(),
            Some(Value::String(s)) if s == "detect" => release.join(self.manifest()).is_file(),
            Some(v) => truthy(Some(v)),
        }
    }

    /// Commands, in order, to install this manager's dependencies for the
    /// active release.
    pub fn install_commands(self, config: &ConfigStore, paths: &ReleasePaths) -> Vec<String> {
        let release = shell_quote(&paths.active_release().to_string_lossy());
        match self {
            DependencyManager::Bundler => {
                let gems = shell_quote(&paths.bundled_gems().to_string_lossy());
                let mut install = format!(
                    "cd {release} && bundle install --gemfile {release}/Gemfile --path {gems} --binstubs {} --deployment",
                    shell_quote(&paths.binstubs().to_string_lossy())
                );
                for opt in config.extra_bundle_install_options() {
                    install.push(' ');
                    install.push_str(&shell_quote(&opt));
                }
                let mut commands = Vec::new();
                if config.clean() {
                    commands.push(format!("rm -rf {gems}"));
                }
                // Gems built against another ruby or architecture are useless.
                commands.push(format!(
                    "if ! (ruby -v | cmp -s - {gems}/RUBY_VERSION && uname -m | cmp -s - {gems}/SYSTEM_VERSION); then rm -rf {gems}; fi"
                ));
                commands.push(install);
                commands.push(format!(
                    "mkdir -p {gems} && ruby -v > {gems}/RUBY_VERSION && uname -m > {gems}/SYSTEM_VERSION"
                ));
                commands
            }
            DependencyManager::Npm => {
                vec![format!("cd {release} && npm install")]
            }
            DependencyManager::Composer => vec![
                "composer self-update".to_string(),
                format!("cd {release} && composer install --no-interaction --no-dev --optimize-autoloader"),
            ],
        }
    }
}

impl fmt::Display for DependencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Managers in use for the release, in install order.
pub fn detect(config: &ConfigStore, release: &Path) -> Vec<DependencyManager> {
    DependencyManager::all()
        .iter()
        .copied()
        .filter(|m| m.enabled(config, release))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source_from;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(value: Value) -> ConfigStore {
        ConfigStore::from_source(source_from(value))
    }

    #[test]
    fn detects_from_manifests() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("composer.json"), "{}").unwrap();
        assert_eq!(
            detect(&config(json!({})), dir.path()),
            vec![DependencyManager::Npm, DependencyManager::Composer]
        );
    }

    #[test]
    fn explicit_settings_override_detection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Gemfile"), "").unwrap();
        let cfg = config(json!({"bundler": "false", "npm": true}));
        assert_eq!(detect(&cfg, dir.path()), vec![DependencyManager::Npm]);
    }

    #[test]
    fn bundler_commands() {
        let paths = ReleasePaths::for_release("shop", Path::new("/data/shop"), "1");
        let cfg = config(json!({"framework_env": "production", "clean": true}));
        let commands = DependencyManager::Bundler.install_commands(&cfg, &paths);
        assert_eq!(commands[0], "rm -rf /data/shop/shared/bundled_gems");
        let install = commands.iter().find(|c| c.contains("bundle install")).unwrap();
        assert!(install.contains("--binstubs /data/shop/releases/1/ey_bundler_binstubs"));
        assert!(install.ends_with("--deployment --without 'test development'"));
    }

    #[test]
    fn composer_self_updates_first() {
        let paths = ReleasePaths::for_release("shop", Path::new("/data/shop"), "1");
        let commands = DependencyManager::Composer
            .install_commands(&config(json!({})), &paths);
        assert_eq!(commands[0], "composer self-update");
        assert!(commands[1].contains("composer install"));
    }
}
