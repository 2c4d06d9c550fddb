use crate::options::{local_fleet, CommonArgs};
use serde_json::Value;
use serverside_core::pipeline::Deploy;
use serverside_core::server::{Role, Server};
use std::path::Path;

/// Run one hook on this machine, as the server named by `current_roles`
/// and `current_name`.
pub fn run(
    name: &str,
    common: &CommonArgs,
    release_path: &Path,
    current_roles: &[String],
    current_name: Option<&str>,
) -> anyhow::Result<()> {
    let mut options = common.source();
    options.insert(
        "release_path".to_string(),
        Value::String(release_path.to_string_lossy().into_owned()),
    );
    options.insert(
        "current_roles".to_string(),
        Value::Array(current_roles.iter().cloned().map(Value::String).collect()),
    );
    if let Some(n) = current_name {
        options.insert("current_name".to_string(), Value::String(n.to_string()));
    }
    let config = common.config_store(options)?;

    let server = Server::new(
        "localhost",
        Role::parse_list(current_roles).into_iter().collect(),
        current_name.map(str::to_string),
        &config.user(),
    );
    let fleet = local_fleet(vec![server], &config)?;
    let deploy = Deploy::new(config, fleet)?;
    deploy.run_hook(name)?;
    Ok(())
}
