use crate::config::ConfigStore;
use crate::error::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DATA_ROOT: &str = "/data";
pub const RELEASES_DIR: &str = "releases";
pub const CURRENT_LINK: &str = "current";
pub const SHARED_DIR: &str = "shared";
pub const REPOSITORY_CACHE_DIR: &str = "shared/cached-copy";

pub const REVISION_FILE: &str = "REVISION";
pub const DEPLOY_HOOKS_DIR: &str = "deploy";
pub const BINSTUBS_DIR: &str = "ey_bundler_binstubs";
pub const MAINTENANCE_PAGE: &str = "maintenance.html";

pub const RELEASE_ID_FORMAT: &str = "%Y%m%d%H%M%S";

pub fn release_id_now() -> String {
    Utc::now().format(RELEASE_ID_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// ReleasePaths
// ---------------------------------------------------------------------------

/// Every on-disk location a deploy touches, derived from the deploy root and
/// the active release. Nothing here reads the filesystem except
/// [`ReleasePaths::list_releases`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePaths {
    app_name: String,
    deploy_root: PathBuf,
    active_release: PathBuf,
    repository_cache: PathBuf,
}

impl ReleasePaths {
    /// `deploy_root` defaults to `/data/<app>`; `active_release` to a fresh
    /// timestamped directory under `releases/`.
    pub fn new(
        app_name: &str,
        deploy_root: Option<&Path>,
        active_release: Option<&Path>,
        repository_cache: Option<&Path>,
    ) -> Self {
        let deploy_root = deploy_root
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Path::new(DATA_ROOT).join(app_name));
        let active_release = active_release
            .map(Path::to_path_buf)
            .unwrap_or_else(|| deploy_root.join(RELEASES_DIR).join(release_id_now()));
        let repository_cache = repository_cache
            .map(Path::to_path_buf)
            .unwrap_or_else(|| deploy_root.join(REPOSITORY_CACHE_DIR));
        Self {
            app_name: app_name.to_string(),
            deploy_root,
            active_release,
            repository_cache,
        }
    }

    /// Same rules, explicit release id under `releases/`.
    pub fn for_release(app_name: &str, deploy_root: &Path, release_id: &str) -> Self {
        Self::new(
            app_name,
            Some(deploy_root),
            Some(&deploy_root.join(RELEASES_DIR).join(release_id)),
            None,
        )
    }

    /// Paths for this deploy: `deploy_to`, `release_path` and
    /// `repository_cache` override the defaults when configured.
    pub fn from_config(config: &ConfigStore) -> Result<Self> {
        let app = config.app()?;
        let path = |key: &str| config.string(key).map(PathBuf::from);
        Ok(Self::new(
            &app,
            path("deploy_to").as_deref(),
            path("release_path").as_deref(),
            path("repository_cache").as_deref(),
        ))
    }

    /// The same layout with the release `current` resolves to as the active
    /// release. Unchanged when nothing has been deployed.
    pub fn at_current(self) -> Self {
        match std::fs::canonicalize(self.current()) {
            Ok(active_release) => Self {
                active_release,
                ..self
            },
            Err(_) => self,
        }
    }

        pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn deploy_root(&self) -> &Path {
        &self.deploy_root
    }

    pub fn active_release(&self) -> &Path {
        &self.active_release
    }

    pub fn repository_cache(&self) -> &Path {
        &self.repository_cache
    }

    pub fn releases(&self) -> PathBuf {
        self.deploy_root.join(RELEASES_DIR)
    }

    pub fn current(&self) -> PathBuf {
        self.deploy_root.join(CURRENT_LINK)
    }

    pub fn shared(&self) -> PathBuf {
        self.deploy_root.join(SHARED_DIR)
    }

    pub fn shared_config(&self) -> PathBuf {
        self.shared().join("config")
    }

    pub fn shared_bin(&self) -> PathBuf {
        self.shared().join("bin")
    }

    pub fn shared_tmp(&self) -> PathBuf {
        self.shared().join("tmp")
    }

    pub fn shared_log(&self) -> PathBuf {
        self.shared().join("log")
    }

    pub fn shared_pids(&self) -> PathBuf {
        self.shared().join("pids")
    }

    pub fn shared_system(&self) -> PathBuf {
        self.shared().join("system")
    }

    /// Service hooks: outside any release, survive across deploys.
    pub fn shared_hooks(&self) -> PathBuf {
        self.shared().join("hooks")
    }

    pub fn shared_assets(&self) -> PathBuf {
        self.shared().join("assets")
    }

    pub fn shared_last_assets(&self) -> PathBuf {
        self.shared().join("last_assets")
    }

    pub fn bundled_gems(&self) -> PathBuf {
        self.shared().join("bundled_gems")
    }

    pub fn maintenance_page(&self) -> PathBuf {
        self.shared_system().join(MAINTENANCE_PAGE)
    }

    pub fn release_dir(&self, release_id: &str) -> PathBuf {
        self.releases().join(release_id)
    }

    // -----------------------------------------------------------------------
    // Inside the active release
    // -----------------------------------------------------------------------

    pub fn active_revision(&self) -> PathBuf {
        self.active_release.join(REVISION_FILE)
    }

    pub fn deploy_hooks(&self) -> PathBuf {
        self.active_release.join(DEPLOY_HOOKS_DIR)
    }

    pub fn binstubs(&self) -> PathBuf {
        self.active_release.join(BINSTUBS_DIR)
    }

    pub fn public(&self) -> PathBuf {
        self.active_release.join("public")
    }

    pub fn public_assets(&self) -> PathBuf {
        self.public().join("assets")
    }

    pub fn public_system(&self) -> PathBuf {
        self.public().join("system")
    }

    pub fn release_config(&self) -> PathBuf {
        self.active_release.join("config")
    }

    /// A path below the active release.
    pub fn in_release(&self, parts: &[&str]) -> PathBuf {
        parts
            .iter()
            .fold(self.active_release.clone(), |p, part| p.join(part))
    }

    // -----------------------------------------------------------------------
    // Release history
    // -----------------------------------------------------------------------

    /// Release directories, oldest first. Release ids are timestamps, so a
    /// lexical sort is chronological.
    pub fn list_releases(&self) -> std::io::Result<Vec<PathBuf>> {
        let dir = self.releases();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut releases = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                releases.push(entry.path());
            }
        }
        releases.sort();
        Ok(releases)
    }

    pub fn latest_release(releases: &[PathBuf]) -> Option<&PathBuf> {
        releases.last()
    }

    /// The release immediately before `from` in `releases`.
    pub fn previous_release<'a>(releases: &'a [PathBuf], from: &Path) -> Option<&'a PathBuf> {
        let idx = releases.iter().position(|r| r == from)?;
        idx.checked_sub(1).and_then(|i| releases.get(i))
    }

    /// The release before the active one, as known from `releases`.
    pub fn previous_release_of_active<'a>(&self, releases: &'a [PathBuf]) -> Option<&'a PathBuf> {
        match Self::previous_release(releases, &self.active_release) {
            Some(prev) => Some(prev),
            // The active release has not been created yet: the newest
            // existing release is the previous one.
            None if !releases.contains(&self.active_release) => releases.last(),
            None => None,
        }
    }

    pub fn previous_revision(&self, releases: &[PathBuf]) -> Option<PathBuf> {
        self.previous_release_of_active(releases)
            .map(|r| r.join(REVISION_FILE))
    }

    /// The view used to roll back: the release before the latest becomes
    /// the active release. `None` when there is nothing to roll back to.
    pub fn rollback(&self, releases: &[PathBuf]) -> Option<ReleasePaths> {
        let latest = Self::latest_release(releases)?;
        let previous = Self::previous_release(releases, latest)?;
        Some(Self {
            app_name: self.app_name.clone(),
            deploy_root: self.deploy_root.clone(),
            active_release: previous.clone(),
            repository_cache: self.repository_cache.clone(),
        })
    }
}

/// Read a revision marker file, trimmed. `None` when missing or empty.
pub fn read_revision(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
