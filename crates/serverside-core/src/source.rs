//! Where the code comes from: a git repository or a downloadable archive.
//!
//! Both strategies keep a working copy in the repository cache on the
//! orchestrator; the pipeline then pushes that copy out to the fleet.

use crate::config::ConfigStore;
use crate::error::{DeployError, Result};
use crate::fleet::ServerFleet;
use crate::paths::ReleasePaths;
use crate::transport::{shell_quote, CommandSpec};
use std::path::{Path, PathBuf};
use tracing::info;

pub trait Source {
    fn name(&self) -> &'static str;

    /// Bring the repository cache to the requested revision.
    fn update_repository_cache(&self, fleet: &ServerFleet) -> Result<()>;

    /// Shell command writing the cache's revision to `<release>/REVISION`.
    /// It runs on every server, so anything only the orchestrator has is
    /// resolved here first.
    fn create_revision_file_command(&self, fleet: &ServerFleet, release: &Path) -> Result<String>;

    /// True if none of `paths` changed between the two revisions.
    fn same_content(
        &self,
        fleet: &ServerFleet,
        previous: &str,
        active: &str,
        paths: &[String],
    ) -> Result<bool>;

    fn gc_repository_cache(&self, fleet: &ServerFleet) -> Result<()>;
}

/// Pick the source named by the configuration: `archive` if given, then an
/// explicit `source_class`, then git.
pub fn source_for(config: &ConfigStore, paths: &ReleasePaths) -> Result<Box<dyn Source>> {
    if config.git().is_some() && config.archive().is_some() {
        return Err(DeployError::ConflictingSources);
    }
    let cache = paths.repository_cache().to_path_buf();
    if let Some(uri) = config.archive() {
        return Ok(Box::new(ArchiveSource::new(Some(uri), cache)));
    }
    match config.source_class().as_deref() {
        None | Some("git") | Some("Git") => Ok(Box::new(GitSource::new(
            config.git(),
            config.branch(),
            cache,
        ))),
        Some("archive") | Some("Archive") => Ok(Box::new(ArchiveSource::new(config.git(), cache))),
        Some(other) => Err(DeployError::UnknownStrategy {
            kind: "source",
            name: other.to_string(),
        }),
    }
}

fn path_arg(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitSource {
    uri: Option<String>,
    git_ref: String,
    repository_cache: PathBuf,
}

impl GitSource {
    pub fn new(uri: Option<String>, git_ref: String, repository_cache: PathBuf) -> Self {
        Self {
            uri,
            git_ref,
            repository_cache,
        }
    }

    fn in_cache(&self, command: &str) -> CommandSpec {
        CommandSpec::new(format!("cd {} && {command}", path_arg(&self.repository_cache)))
    }
}

impl Source for GitSource {
    fn name(&self) -> &'static str {
        "git"
    }

    fn update_repository_cache(&self, fleet: &ServerFleet) -> Result<()> {
        let uri = self
            .uri
            .as_deref()
            .ok_or_else(|| DeployError::MissingConfig("git".to_string()))?;
        info!("Fetching updates from {uri}.");
        let cache = path_arg(&self.repository_cache);
        if !self.repository_cache.join(".git").is_dir() {
            fleet.run_local_strict(&CommandSpec::new(format!(
                "mkdir -p {cache} && git clone -q {} {cache}",
                shell_quote(uri)
            )))?;
        } else {
            fleet.run_local_strict(&self.in_cache(&format!(
                "git remote set-url origin {}",
                shell_quote(uri)
            )))?;
        }
        let git_ref = shell_quote(&self.git_ref);
        fleet.run_local_strict(&self.in_cache(&format!(
            "git fetch -q origin && git fetch -q --tags origin && \
             git reset -q --hard \"$(git rev-parse --verify -q origin/{git_ref} || git rev-parse --verify -q {git_ref})\" && \
             git submodule sync && git submodule update --init && git clean -dfq"
        )))?;
        Ok(())
    }

    fn create_revision_file_command(&self, _fleet: &ServerFleet, release: &Path) -> Result<String> {
        Ok(format!(
            "cd {} && git show --pretty=format:\"%H\" | head -1 > {}",
            path_arg(&self.repository_cache),
            path_arg(&release.join("REVISION"))
        ))
    }

    fn same_content(
        &self,
        fleet: &ServerFleet,
        previous: &str,
        active: &str,
        paths: &[String],
    ) -> Result<bool> {
        let paths: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
        let output = fleet.run_local(&self.in_cache(&format!(
            "git diff --exit-code --name-only {}..{} -- {}",
            shell_quote(previous),
            shell_quote(active),
            paths.join(" ")
        )))?;
        Ok(output.success)
    }

    fn gc_repository_cache(&self, fleet: &ServerFleet) -> Result<()> {
        info!("Garbage collecting cached git repository to reduce disk usage.");
        fleet.run_local_strict(&self.in_cache("git gc"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

pub const ARCHIVE_FILE: &str = "app.zip";

#[derive(Debug, Clone)]
pub struct ArchiveSource {
    uri: Option<String>,
    repository_cache: PathBuf,
}

impl ArchiveSource {
    pub fn new(uri: Option<String>, repository_cache: PathBuf) -> Self {
        Self {
            uri,
            repository_cache,
        }
    }

    /// Downloads live next to the cache so the cache itself only holds the
    /// unpacked tree.
    fn archive_path(&self) -> PathBuf {
        self.repository_cache
            .parent()
            .unwrap_or(Path::new("/"))
            .join(ARCHIVE_FILE)
    }
}

impl Source for ArchiveSource {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn update_repository_cache(&self, fleet: &ServerFleet) -> Result<()> {
        let uri = self
            .uri
            .as_deref()
            .ok_or_else(|| DeployError::MissingConfig("archive".to_string()))?;
        info!("Downloading archive from {uri}.");
        let archive = path_arg(&self.archive_path());
        let cache = path_arg(&self.repository_cache);
        fleet.run_local_strict(&CommandSpec::new(format!(
            "curl --fail --silent --show-error --location --output {archive} {} && \
             rm -rf {cache} && mkdir -p {cache} && unzip -q -o {archive} -d {cache}",
            shell_quote(uri)
        )))?;
        Ok(())
    }

    /// The revision of an archive is its checksum. Only the orchestrator
    /// holds the archive, so the sum is taken there and written literally.
    fn create_revision_file_command(&self, fleet: &ServerFleet, release: &Path) -> Result<String> {
        let archive = path_arg(&self.archive_path());
        let output = fleet.run_local_strict(&CommandSpec::new(format!("shasum {archive}")))?;
        let checksum = output
            .output
            .split_whitespace()
            .next()
            .filter(|sum| sum.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| DeployError::InvalidConfig {
                key: "archive".to_string(),
                message: format!("no checksum for {archive}: {}", output.output.trim()),
            })?;
        Ok(format!(
            "echo {checksum} > {}",
            path_arg(&release.join("REVISION"))
        ))
    }

    fn same_content(
        &self,
        _fleet: &ServerFleet,
        previous: &str,
        active: &str,
        _paths: &[String],
    ) -> Result<bool> {
        Ok(previous == active)
    }

    fn gc_repository_cache(&self, _fleet: &ServerFleet) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source_from;
    use crate::fleet::tests::server;
    use crate::server::Role;
    use crate::transport::testing::RecordingTransport;
    use crate::transport::CommandOutput;
    use serde_json::json;
    use std::sync::Arc;

    fn paths() -> ReleasePaths {
        ReleasePaths::for_release("shop", Path::new("/data/shop"), "1")
    }

    fn config(value: serde_json::Value) -> ConfigStore {
        ConfigStore::from_source(source_from(value))
    }

    fn fleet(transport: &Arc<RecordingTransport>) -> ServerFleet {
        ServerFleet::new(vec![server("localhost", &[Role::Solo])], transport.clone(), 1).unwrap()
    }

    #[test]
    fn picks_git_by_default() {
        let source = source_for(&config(json!({"git": "git@x:y.git"})), &paths()).unwrap();
        assert_eq!(source.name(), "git");
        let source = source_for(&config(json!({})), &paths()).unwrap();
        assert_eq!(source.name(), "git");
    }

    #[test]
    fn picks_archive() {
        let source = source_for(&config(json!({"archive": "https://x/app.zip"})), &paths()).unwrap();
        assert_eq!(source.name(), "archive");
        let source = source_for(
            &config(json!({"source_class": "Archive", "git": "https://x/app.zip"})),
            &paths(),
        )
        .unwrap();
        assert_eq!(source.name(), "archive");
    }

    #[test]
    fn conflicting_and_unknown_sources() {
        let err = source_for(&config(json!({"git": "a", "archive": "b"})), &paths()).err().unwrap();
        assert!(matches!(err, DeployError::ConflictingSources));
        let err = source_for(&config(json!({"source_class": "Svn"})), &paths()).err().unwrap();
        assert_eq!(err.to_string(), "unknown source 'Svn'");
    }

    #[test]
    fn git_revision_file_command() {
        let transport = Arc::new(RecordingTransport::new());
        let git = GitSource::new(None, "master".into(), PathBuf::from("/data/shop/shared/cached-copy"));
        assert_eq!(
            git.create_revision_file_command(&fleet(&transport), Path::new("/data/shop/releases/1"))
                .unwrap(),
            "cd /data/shop/shared/cached-copy && git show --pretty=format:\"%H\" | head -1 > /data/shop/releases/1/REVISION"
        );
    }

    #[test]
    fn git_diff_decides_same_content() {
        let transport = Arc::new(RecordingTransport::new());
        let git = GitSource::new(None, "master".into(), PathBuf::from("/c"));
        let deps = vec!["app/assets".to_string(), "Gemfile.lock".to_string()];
        assert!(git.same_content(&fleet(&transport), "aaa", "bbb", &deps).unwrap());
        assert_eq!(
            transport.local_commands(),
            vec!["cd /c && git diff --exit-code --name-only aaa..bbb -- app/assets Gemfile.lock"]
        );

        transport.respond("git diff", CommandOutput::failed(1, "app/assets/x.css\n"));
        assert!(!git.same_content(&fleet(&transport), "aaa", "bbb", &deps).unwrap());
    }

    #[test]
    fn git_update_requires_uri() {
        let transport = Arc::new(RecordingTransport::new());
        let git = GitSource::new(None, "master".into(), PathBuf::from("/nonexistent/cache"));
        let err = git.update_repository_cache(&fleet(&transport)).unwrap_err();
        assert!(matches!(err, DeployError::MissingConfig(k) if k == "git"));
    }

    #[test]
    fn git_update_clones_then_resets() {
        let transport = Arc::new(RecordingTransport::new());
        let git = GitSource::new(
            Some("git@github.com:acme/shop.git".into()),
            "deploy-branch".into(),
            PathBuf::from("/nonexistent/cache"),
        );
        git.update_repository_cache(&fleet(&transport)).unwrap();
        let commands = transport.local_commands();
        assert!(commands[0].contains("git clone -q git@github.com:acme/shop.git /nonexistent/cache"));
        assert!(commands[1].contains("origin/deploy-branch"));
        assert!(commands[1].contains("git clean -dfq"));
    }

    #[test]
    fn archive_same_content_compares_checksums() {
        let transport = Arc::new(RecordingTransport::new());
        let archive = ArchiveSource::new(Some("https://x/app.zip".into()), PathBuf::from("/data/shop/shared/cached-copy"));
        assert!(archive.same_content(&fleet(&transport), "abc", "abc", &[]).unwrap());
        assert!(!archive.same_content(&fleet(&transport), "abc", "def", &[]).unwrap());
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn archive_revision_is_summed_on_the_orchestrator() {
        let transport = Arc::new(RecordingTransport::new());
        transport.respond(
            "shasum",
            CommandOutput::ok("3f786850e387550fdab836ed7e6dc881de23001b  /data/shop/shared/app.zip\n"),
        );
        let servers = vec![
            server("localhost", &[Role::AppMaster]),
            server("app1.internal", &[Role::App]),
        ];
        let fleet = ServerFleet::new(servers, transport.clone(), 2).unwrap();
        let archive = ArchiveSource::new(Some("https://x/app.zip".into()), PathBuf::from("/data/shop/shared/cached-copy"));
        let command = archive
            .create_revision_file_command(&fleet, Path::new("/data/shop/releases/1"))
            .unwrap();
        fleet.run(CommandSpec::new(command)).unwrap();

        assert_eq!(transport.local_commands(), vec!["shasum /data/shop/shared/app.zip"]);
        assert_eq!(
            transport.commands_on("app1.internal"),
            vec!["echo 3f786850e387550fdab836ed7e6dc881de23001b > /data/shop/releases/1/REVISION"]
        );
    }

    #[test]
    fn archive_revision_requires_a_checksum() {
        let transport = Arc::new(RecordingTransport::new());
        let archive = ArchiveSource::new(Some("https://x/app.zip".into()), PathBuf::from("/c"));
        assert!(archive
            .create_revision_file_command(&fleet(&transport), Path::new("/r"))
            .is_err());
        transport.respond("shasum", CommandOutput::failed(1, "shasum: /shared/app.zip: No such file"));
        assert!(matches!(
            archive.create_revision_file_command(&fleet(&transport), Path::new("/r")),
            Err(DeployError::Remote(_))
        ));
    }
}
