use crate::error::Result;
use std::path::{Path, PathBuf};

/// Read a file that may legitimately be absent.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The first of `candidates` that exists as a regular file.
pub fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

/// Regular file with any execute bit set.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Parse a YAML file into a JSON value tree. `None` when the file is absent.
pub fn read_yaml_value(path: &Path) -> Result<Option<serde_json::Value>> {
    match read_optional(path)? {
        None => Ok(None),
        Some(text) if text.trim().is_empty() => Ok(Some(serde_json::Value::Null)),
        Some(text) => Ok(Some(serde_yaml::from_str(&text)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_optional_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_optional(&dir.path().join("nope")).unwrap().is_none());
        std::fs::write(dir.path().join("yes"), "x").unwrap();
        assert_eq!(read_optional(&dir.path().join("yes")).unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn first_existing_respects_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("eydeploy.yml");
        let b = dir.path().join("config/eydeploy.yml");
        std::fs::create_dir_all(b.parent().unwrap()).unwrap();
        std::fs::write(&b, "").unwrap();
        assert_eq!(first_existing(&[a.clone(), b.clone()]), Some(b.clone()));
        std::fs::write(&a, "").unwrap();
        assert_eq!(first_existing(&[a.clone(), b]), Some(a));
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hook");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        assert!(!is_executable(&path));
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&path));
        assert!(!is_executable(dir.path()));
    }

    #[test]
    fn yaml_into_json_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ey.yml");
        std::fs::write(&path, "defaults:\n  bundle_without: test\n").unwrap();
        let value = read_yaml_value(&path).unwrap().unwrap();
        assert_eq!(value["defaults"]["bundle_without"], "test");
    }
}
