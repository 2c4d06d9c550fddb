//! One command, one server.
//!
//! A [`Transport`] is the only place processes are spawned. Local commands
//! run under `sh -l -c`; remote ones are wrapped the same way and sent over
//! `ssh`. The environment is always passed explicitly with the command,
//! never through the orchestrator's own process environment.

use crate::error::{DeployError, Result};
use crate::server::Server;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

// ---------------------------------------------------------------------------
// CommandSpec / CommandOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    /// Ordered; rendered in this order for remote execution.
    pub env: Vec<(String, String)>,
    pub dir: Option<PathBuf>,
    pub sudo: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn sudo(command: impl Into<String>) -> Self {
        Self {
            sudo: true,
            ..Self::new(command)
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// The command line with `cd` and the `K=V` prefix applied, as a shell
    /// would see it.
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        if let Some(dir) = &self.dir {
            out.push_str("cd ");
            out.push_str(&shell_quote(&dir.to_string_lossy()));
            out.push_str(" && ");
        }
        out.push_str(&render_env_prefix(&self.env));
        out.push_str(&self.command);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            output: output.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub trait Transport: Send + Sync {
    /// Run `spec` against `server`: in-process shell when the server is
    /// local, over ssh otherwise. A non-zero exit is an `Ok` output with
    /// `success == false`; `Err` means the command could not be spawned.
    fn run(&self, server: &Server, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run on the orchestrator machine regardless of any server.
    fn run_local(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// ssh / rsync command lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub identity_file: PathBuf,
}

impl Default for SshOptions {
    fn default() -> Self {
        let home = home::home_dir().unwrap_or_else(|| PathBuf::from("~"));
        Self {
            identity_file: home.join(".ssh").join("internal"),
        }
    }
}

impl SshOptions {
    pub fn args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.identity_file.to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=DEBUG".to_string(),
            "-o".to_string(),
            "PasswordAuthentication=no".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=60".to_string(),
        ]
    }

    /// The `ssh ...` prefix as one string, for `rsync -e`.
    pub fn command(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.args().iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }

    /// A command line that runs `command` on `server` when executed on the
    /// orchestrator.
    pub fn remote_command(&self, server: &Server, command: &str, sudo: bool) -> String {
        format!(
            "{} {} {}",
            self.command(),
            server.destination(),
            shell_quote(&wrap_shell(command, sudo))
        )
    }

    /// `rsync` mirroring `dir` to the same path on `server`.
    pub fn sync_command(&self, server: &Server, dir: &Path, ignore_existing: bool) -> String {
        let dir = dir.to_string_lossy();
        let dir = dir.trim_end_matches('/');
        let ignore = if ignore_existing { " --ignore-existing" } else { "" };
        format!(
            "rsync --delete -rlpgoDq{ignore} -e {} {}/ {}:{}",
            shell_quote(&self.command()),
            shell_quote(dir),
            server.destination(),
            shell_quote(dir),
        )
    }
}

// ---------------------------------------------------------------------------
// ShellTransport
// ---------------------------------------------------------------------------

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct ShellTransport {
    pub ssh: SshOptions,
}

impl ShellTransport {
    pub fn new(ssh: SshOptions) -> Self {
        Self { ssh }
    }

    fn spawn(&self, mut cmd: Command, display: &str) -> Result<CommandOutput> {
        let out = cmd.output().map_err(|e| DeployError::Spawn {
            command: display.to_string(),
            message: e.to_string(),
        })?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            success: out.status.success(),
            code: out.status.code(),
            output,
        })
    }
}

impl Transport for ShellTransport {
    fn run(&self, server: &Server, spec: &CommandSpec) -> Result<CommandOutput> {
        if server.is_local() {
            return self.run_local(spec);
        }
        let remote = wrap_shell(&spec.rendered(), spec.sudo);
        debug!("{}: {remote}", server.hostname);
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh.args()).arg(server.destination()).arg(&remote);
        self.spawn(cmd, &remote)
    }

    fn run_local(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if spec.sudo {
            // sudo resets the environment, so it travels as a prefix.
            let line = wrap_shell(&spec.rendered(), true);
            debug!("local: {line}");
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&line);
            return self.spawn(cmd, &line);
        }
        debug!("local: {}", spec.rendered());
        let mut cmd = Command::new("sh");
        cmd.arg("-l").arg("-c").arg(&spec.command);
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }
        self.spawn(cmd, &spec.rendered())
    }
}

fn wrap_shell(command: &str, sudo: bool) -> String {
    let wrapped = format!("sh -l -c {}", shell_quote(command));
    if sudo {
        format!("sudo {wrapped}")
    } else {
        wrapped
    }
}

// ---------------------------------------------------------------------------
// Quoting
// ---------------------------------------------------------------------------

/// Quote one word for a POSIX shell. Words made only of safe characters pass
/// through unchanged; the empty string becomes `''`.
pub fn shell_quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    let safe = word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// `K1=V1 K2=V2 ` with each value quoted. Empty for an empty map.
pub fn render_env_prefix(env: &[(String, String)]) -> String {
    env.iter()
        .map(|(k, v)| format!("{k}={} ", shell_quote(v)))
        .collect()
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
