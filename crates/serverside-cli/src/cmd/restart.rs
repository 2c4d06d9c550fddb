use crate::options::CommonArgs;
use serverside_core::pipeline::Deploy;

/// Restart the current release, behind the maintenance page if the stack
/// needs one.
pub fn run(common: &CommonArgs) -> anyhow::Result<()> {
    let config = common.config_store(common.source())?;
    let fleet = common.fleet(&config)?;
    let mut deploy = Deploy::new(config, fleet)?;
    deploy.use_current_release()?;
    deploy.require_custom_tasks()?;
    deploy.restart_with_maintenance_page()?;
    Ok(())
}
