//! Parallel command execution over the servers in a deploy.
//!
//! Every fleet-wide call builds one command per server, issues them all, and
//! blocks until each has finished. Calls never overlap, so commands issued by
//! consecutive calls reach a given server in order.

use crate::error::{DeployError, RemoteFailure, Result, ServerFailure};
use crate::server::{check_single_local, Role, Server};
use crate::transport::{shell_quote, CommandOutput, CommandSpec, SshOptions, Transport};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

// ---------------------------------------------------------------------------
// ServerResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerResult {
    pub server: Server,
    pub command: String,
    pub output: CommandOutput,
}

impl ServerResult {
    pub fn success(&self) -> bool {
        self.output.success
    }
}

/// Turn any failed results into one [`RemoteFailure`].
pub fn check_results(results: Vec<ServerResult>) -> Result<Vec<ServerResult>> {
    let failures: Vec<ServerFailure> = results
        .iter()
        .filter(|r| !r.success())
        .map(|r| ServerFailure {
            hostname: r.server.hostname.clone(),
            command: r.command.clone(),
            output: r.output.output.clone(),
        })
        .collect();
    if failures.is_empty() {
        Ok(results)
    } else {
        Err(DeployError::Remote(RemoteFailure { failures }))
    }
}

// ---------------------------------------------------------------------------
// ServerFleet
// ---------------------------------------------------------------------------

/// A set of servers plus the means to reach them. Cloning is cheap; scoped
/// views share the transport and runtime of the fleet they came from.
#[derive(Clone)]
pub struct ServerFleet {
    servers: Vec<Server>,
    transport: Arc<dyn Transport>,
    runtime: Arc<Runtime>,
    max_connections: usize,
    ssh: SshOptions,
}

impl std::fmt::Debug for ServerFleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFleet")
            .field("servers", &self.servers)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl ServerFleet {
    pub fn new(
        servers: Vec<Server>,
        transport: Arc<dyn Transport>,
        max_connections: usize,
    ) -> Result<Self> {
        check_single_local(&servers)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            servers,
            transport,
            runtime: Arc::new(runtime),
            max_connections: max_connections.max(1),
            ssh: SshOptions::default(),
        })
    }

    pub fn with_ssh(mut self, ssh: SshOptions) -> Self {
        self.ssh = ssh;
        self
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.hostname.as_str()).collect()
    }

    pub fn ssh(&self) -> &SshOptions {
        &self.ssh
    }

    fn view(&self, servers: Vec<Server>) -> Self {
        Self {
            servers,
            transport: Arc::clone(&self.transport),
            runtime: Arc::clone(&self.runtime),
            max_connections: self.max_connections,
            ssh: self.ssh.clone(),
        }
    }

    /// Servers carrying any of `roles`.
    pub fn select(&self, roles: &[Role]) -> Self {
        self.view(
            self.servers
                .iter()
                .filter(|s| s.matches_roles(roles))
                .cloned()
                .collect(),
        )
    }

    /// Run `f` against the servers carrying any of `roles`. The fleet itself
    /// is left as it was.
    pub fn with_roles<R>(&self, roles: &[Role], f: impl FnOnce(&ServerFleet) -> R) -> R {
        f(&self.select(roles))
    }

    pub fn local(&self) -> Option<&Server> {
        self.servers.iter().find(|s| s.is_local())
    }

    pub fn remote(&self) -> Self {
        self.view(
            self.servers
                .iter()
                .filter(|s| !s.is_local())
                .cloned()
                .collect(),
        )
    }

    /// Split into `groups` consecutive batches of near-equal size. Empty
    /// batches are dropped.
    pub fn batches(&self, groups: usize) -> Vec<ServerFleet> {
        if self.servers.is_empty() {
            return Vec::new();
        }
        let size = self.servers.len().div_ceil(groups.max(1));
        self.servers
            .chunks(size)
            .map(|chunk| self.view(chunk.to_vec()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Build a command per server (`None` skips that server), run them all
    /// concurrently and return every result, failed or not.
    pub fn run_for_each<F>(&self, builder: F) -> Vec<ServerResult>
    where
        F: Fn(&Server) -> Option<CommandSpec>,
    {
        self.fan_out(builder, false)
    }

    /// Like [`ServerFleet::run_for_each`], but any failure becomes one
    /// aggregated error. Every command is still issued.
    pub fn run_for_each_strict<F>(&self, builder: F) -> Result<Vec<ServerResult>>
    where
        F: Fn(&Server) -> Option<CommandSpec>,
    {
        check_results(self.run_for_each(builder))
    }

    /// Per-server commands that execute on the orchestrator, such as an
    /// rsync push to each server.
    pub fn run_for_each_from_local<F>(&self, builder: F) -> Result<Vec<ServerResult>>
    where
        F: Fn(&Server) -> Option<CommandSpec>,
    {
        check_results(self.fan_out(builder, true))
    }

    /// The same command on every server.
    pub fn run(&self, spec: CommandSpec) -> Result<Vec<ServerResult>> {
        self.run_for_each_strict(|_| Some(spec.clone()))
    }

    pub fn sudo(&self, command: impl Into<String>) -> Result<Vec<ServerResult>> {
        self.run(CommandSpec::sudo(command))
    }

    /// Run once on the orchestrator; failure is an ordinary output.
    pub fn run_local(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.transport.run_local(spec)
    }

    /// Run once on the orchestrator; failure is an error.
    pub fn run_local_strict(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run_local(spec)?;
        if output.success {
            Ok(output)
        } else {
            Err(RemoteFailure::single("localhost", spec.rendered(), output.output).into())
        }
    }

    /// Mirror `dir` from the orchestrator to every remote server.
    pub fn sync_directory(&self, dir: &Path, ignore_existing: bool) -> Result<()> {
        let ssh = self.ssh.clone();
        let dir_display = dir.to_string_lossy().into_owned();
        self.remote().run_for_each_from_local(|server| {
            let mkdir = format!(
                "{} {} {}",
                ssh.command(),
                server.destination(),
                shell_quote(&format!("mkdir -p {}", shell_quote(&dir_display))),
            );
            Some(CommandSpec::new(format!(
                "{mkdir} && {}",
                ssh.sync_command(server, dir, ignore_existing)
            )))
        })?;
        Ok(())
    }

    fn fan_out<F>(&self, builder: F, on_orchestrator: bool) -> Vec<ServerResult>
    where
        F: Fn(&Server) -> Option<CommandSpec>,
    {
        let jobs: Vec<(Server, CommandSpec)> = self
            .servers
            .iter()
            .filter_map(|s| builder(s).map(|spec| (s.clone(), spec)))
            .collect();
        if jobs.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let transport = Arc::clone(&self.transport);
        let tasks: Vec<(Server, CommandSpec)> = jobs.clone();

        let mut outputs: Vec<Option<CommandOutput>> = self.runtime.block_on(async move {
            let mut set = JoinSet::new();
            for (idx, (server, spec)) in tasks.into_iter().enumerate() {
                let sem = Arc::clone(&semaphore);
                let transport = Arc::clone(&transport);
                set.spawn(async move {
                    let _permit = sem.acquire_owned().await.ok();
                    debug!("{}: {}", server.hostname, spec.rendered());
                    let joined = tokio::task::spawn_blocking(move || {
                        if on_orchestrator {
                            transport.run_local(&spec)
                        } else {
                            transport.run(&server, &spec)
                        }
                    })
                    .await;
                    let output = match joined {
                        Ok(Ok(output)) => output,
                        Ok(Err(e)) => spawn_failure(e.to_string()),
                        Err(e) => spawn_failure(format!("task join error: {e}")),
                    };
                    (idx, output)
                });
            }

            let mut outputs = Vec::new();
            outputs.resize_with(set.len(), || None);
            while let Some(joined) = set.join_next().await {
                if let Ok((idx, output)) = joined {
                    outputs[idx] = Some(output);
                }
            }
            outputs
        });

        jobs.into_iter()
            .zip(outputs.iter_mut())
            .map(|((server, spec), output)| {
                let output = output
                    .take()
                    .unwrap_or_else(|| spawn_failure("task did not complete".to_string()));
                if !output.output.is_empty() {
                    debug!("{}: {}", server.hostname, output.output.trim_end());
                }
                ServerResult {
                    command: spec.rendered(),
                    server,
                    output,
                }
            })
            .collect()
    }
}

fn spawn_failure(message: String) -> CommandOutput {
    CommandOutput {
        success: false,
        code: None,
        output: message,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
