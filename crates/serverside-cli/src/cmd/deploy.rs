use crate::options::{CommonArgs, SourceArgs};
use anyhow::Context;
use clap::ValueEnum;
use serverside_core::pipeline::Deploy;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeployAction {
    /// Update the repository cache, then deploy
    Deploy,
    /// Deploy what is already in the repository cache
    #[value(name = "cached_deploy")]
    CachedDeploy,
    /// Return to the previous release
    Rollback,
}

impl fmt::Display for DeployAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployAction::Deploy => f.write_str("deploy"),
            DeployAction::CachedDeploy => f.write_str("cached_deploy"),
            DeployAction::Rollback => f.write_str("rollback"),
        }
    }
}

pub fn run(action: DeployAction, common: &CommonArgs, source: &SourceArgs) -> anyhow::Result<()> {
    let mut options = common.source();
    source.extend(&mut options);
    let config = common.config_store(options)?;
    let fleet = common.fleet(&config)?;
    let mut deploy = Deploy::new(config, fleet)?;
    match action {
        DeployAction::Deploy => deploy.deploy(),
        DeployAction::CachedDeploy => deploy.cached_deploy(),
        DeployAction::Rollback => deploy.rollback(),
    }
    .with_context(|| format!("{action} of {} failed", common.app))
}
