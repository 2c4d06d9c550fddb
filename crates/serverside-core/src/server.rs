use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// A server tag. Tags are not exclusive: a solo instance is also the
/// database and the app master.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    App,
    AppMaster,
    DbMaster,
    DbSlave,
    Solo,
    Util,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::App => "app",
            Role::AppMaster => "app_master",
            Role::DbMaster => "db_master",
            Role::DbSlave => "db_slave",
            Role::Solo => "solo",
            Role::Util => "util",
            Role::Other(s) => s,
        }
    }

    pub fn known() -> &'static [Role] {
        &[
            Role::App,
            Role::AppMaster,
            Role::DbMaster,
            Role::DbSlave,
            Role::Solo,
            Role::Util,
        ]
    }

    /// Roles that serve application traffic.
    pub fn app_roles() -> Vec<Role> {
        vec![Role::AppMaster, Role::App, Role::Solo]
    }

    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Vec<Role> {
        names.iter().map(|n| Role::from(n.as_ref())).collect()
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "app" => Role::App,
            "app_master" => Role::AppMaster,
            "db_master" => Role::DbMaster,
            "db_slave" => Role::DbSlave,
            "solo" => Role::Solo,
            "util" => Role::Util,
            other => Role::Other(other.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::from(s.as_str())
    }
}

impl From<Role> for String {
    fn from(r: Role) -> Self {
        r.as_str().to_string()
    }
}

impl FromStr for Role {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DeployError::InvalidServer("empty role".to_string()));
        }
        Ok(Role::from(s))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub hostname: String,
    pub roles: BTreeSet<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub user: String,
}

impl Server {
    pub fn new(hostname: impl Into<String>, roles: BTreeSet<Role>, name: Option<String>, user: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            roles,
            name,
            user: user.into(),
        }
    }

    /// The orchestrator machine itself.
    pub fn is_local(&self) -> bool {
        matches!(self.hostname.as_str(), "localhost" | "127.0.0.1")
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }

    pub fn matches_roles(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    /// `user@host`, the rsync/ssh destination.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.to_string()).collect()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}({})", self.hostname, name),
            None => f.write_str(&self.hostname),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance list parsing
// ---------------------------------------------------------------------------

/// Build the server list from the `--instances`, `--instance-roles`
/// (`host:role1,role2`) and `--instance-names` (`host:name`) inputs.
///
/// Every host in `instances` becomes a server; a host with no roles entry is
/// an error, as is more than one local host.
pub fn servers_from_instances(
    instances: &[String],
    instance_roles: &[String],
    instance_names: &[String],
    user: &str,
) -> Result<Vec<Server>> {
    let roles_by_host = parse_pairs(instance_roles, "--instance-roles")?;
    let names_by_host = parse_pairs(instance_names, "--instance-names")?;

    let mut servers = Vec::with_capacity(instances.len());
    for host in instances {
        let host = host.trim();
        if host.is_empty() {
            continue;
        }
        let roles_spec = roles_by_host
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, r)| r.as_str())
            .ok_or_else(|| DeployError::InvalidServer(format!("no roles given for instance {host}")))?;
        let roles = roles_spec
            .split(',')
            .filter(|r| !r.trim().is_empty())
            .map(str::parse)
            .collect::<Result<BTreeSet<Role>>>()?;
        let name = names_by_host
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, n)| n.clone())
            .filter(|n| !n.is_empty());
        servers.push(Server::new(host, roles, name, user));
    }

    check_single_local(&servers)?;
    Ok(servers)
}

/// At most one server may be the orchestrator itself.
pub fn check_single_local(servers: &[Server]) -> Result<()> {
    let local: Vec<&str> = servers
        .iter()
        .filter(|s| s.is_local())
        .map(|s| s.hostname.as_str())
        .collect();
    if local.len() > 1 {
        return Err(DeployError::InvalidServer(format!(
            "more than one local server: {}",
            local.join(", ")
        )));
    }
    Ok(())
}

fn parse_pairs(items: &[String], flag: &str) -> Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| {
            item.split_once(':')
                .map(|(h, v)| (h.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| {
                    DeployError::InvalidServer(format!("{flag} expects host:value, got {item:?}"))
                })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn role_round_trips_through_strings() {
        for role in Role::known() {
            assert_eq!(&Role::from(role.as_str()), role);
        }
        assert_eq!(Role::from("resque"), Role::Other("resque".into()));
        assert_eq!(Role::Other("resque".into()).to_string(), "resque");
    }

    #[test]
    fn role_serde_is_a_plain_string() {
        let yaml = serde_yaml::to_string(&vec![Role::AppMaster, Role::Other("x".into())]).unwrap();
        assert!(yaml.contains("app_master"));
        let back: Vec<Role> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, vec![Role::AppMaster, Role::Other("x".into())]);
    }

    #[test]
    fn parses_instances_with_roles_and_names() {
        let servers = servers_from_instances(
            &strings(&["localhost", "app1.internal", "db.internal"]),
            &strings(&["localhost:app_master", "app1.internal:app,resque", "db.internal:db_master"]),
            &strings(&["app1.internal:web1"]),
            "deploy",
        )
        .unwrap();
        assert_eq!(servers.len(), 3);
        assert!(servers[0].is_local());
        assert!(servers[0].has_role(&Role::AppMaster));
        assert!(servers[1].has_role(&Role::App));
        assert!(servers[1].has_role(&Role::Other("resque".into())));
        assert_eq!(servers[1].name.as_deref(), Some("web1"));
        assert_eq!(servers[1].destination(), "deploy@app1.internal");
        assert_eq!(servers[1].to_string(), "app1.internal(web1)");
        assert_eq!(servers[2].name, None);
    }

    #[test]
    fn missing_roles_is_an_error() {
        let err = servers_from_instances(&strings(&["app1"]), &[], &[], "deploy").unwrap_err();
        assert!(err.to_string().contains("no roles given for instance app1"));
    }

    #[test]
    fn two_local_servers_is_an_error() {
        let err = servers_from_instances(
            &strings(&["localhost", "127.0.0.1"]),
            &strings(&["localhost:app_master", "127.0.0.1:app"]),
            &[],
            "deploy",
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than one local server"));
    }

    #[test]
    fn malformed_pair_is_an_error() {
        let err = servers_from_instances(
            &strings(&["app1"]),
            &strings(&["app1-app"]),
            &[],
            "deploy",
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::InvalidServer(_)));
    }

    #[test]
    fn matches_any_role() {
        let server = Server::new("h", [Role::Util].into_iter().collect(), None, "deploy");
        assert!(server.matches_roles(&[Role::App, Role::Util]));
        assert!(!server.matches_roles(&Role::app_roles()));
    }
}
