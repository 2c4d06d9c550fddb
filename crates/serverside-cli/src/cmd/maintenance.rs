use crate::options::CommonArgs;
use serverside_core::maintenance::Maintenance;
use serverside_core::paths::ReleasePaths;

#[derive(Debug, Clone, Copy)]
pub enum Toggle {
    Enable,
    Disable,
    Status,
}

pub fn run(toggle: Toggle, common: &CommonArgs) -> anyhow::Result<()> {
    let config = common.config_store(common.source())?;
    let paths = ReleasePaths::from_config(&config)?.at_current();
    let fleet = common.fleet(&config)?;
    let maintenance = Maintenance::new(&paths, &fleet);
    match toggle {
        Toggle::Enable => maintenance.enable()?,
        Toggle::Disable => maintenance.disable()?,
        Toggle::Status => println!("Maintenance page: {}", maintenance.status()),
    }
    Ok(())
}
