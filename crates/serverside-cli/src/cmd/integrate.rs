use crate::options::{CommonArgs, SourceArgs};
use anyhow::Context;
use serverside_core::pipeline::Deploy;

pub fn run(common: &CommonArgs, source: &SourceArgs, ignore_existing: bool) -> anyhow::Result<()> {
    let mut options = common.source();
    source.extend(&mut options);
    let config = common.config_store(options)?;
    let fleet = common.fleet(&config)?;
    let mut deploy = Deploy::new(config, fleet)?;
    deploy
        .integrate(ignore_existing)
        .with_context(|| format!("integrating new servers into {} failed", common.app))
}
