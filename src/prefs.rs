//! Persisted relay list and local identity under the state root.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// One persisted relay with the groups joined on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    /// Relay WebSocket URL.
    pub url: String,
    /// Group ids in the order they were added.
    #[serde(default)]
    pub groups: Vec<String>,
}

fn relays_file(root: &Path) -> PathBuf {
    root.join("relays.json")
}

fn identity_file(root: &Path) -> PathBuf {
    root.join("identity.key")
}

/// Load the persisted relays; a missing file means none.
pub fn load_relays(root: &Path) -> Result<Vec<RelayRecord>> {
    let path = relays_file(root);
    if !path.exists() {
        return Ok(vec![]);
    }
    let data = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replace the persisted relay list.
pub fn save_relays(root: &Path, relays: &[RelayRecord]) -> Result<()> {
    let data = serde_json::to_string_pretty(relays)?;
    write_atomic(&relays_file(root), data.as_bytes(), false)
}

/// Hex secret key of the local identity, if one was saved.
pub fn load_identity(root: &Path) -> Result<Option<String>> {
    let path = identity_file(root);
    if !path.exists() {
        return Ok(None);
    }
    let secret = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let secret = secret.trim();
    Ok((!secret.is_empty()).then(|| secret.to_string()))
}

/// Save the hex secret key readable by the owner only.
pub fn save_identity(root: &Path, secret_hex: &str) -> Result<()> {
    write_atomic(&identity_file(root), secret_hex.as_bytes(), true)
}

/// Remove the relay list and identity. Missing files are fine.
pub fn clear(root: &Path) -> Result<()> {
    for path in [relays_file(root), identity_file(root)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8], private: bool) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("missing parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    if private {
        restrict_to_owner(tmp.path())?;
    }
    tmp.persist(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn relays_roundtrip_in_order() {
        let dir = tempdir().unwrap();
        assert!(load_relays(dir.path()).unwrap().is_empty());
        let relays = vec![
            RelayRecord {
                url: "wss://b.example".into(),
                groups: vec!["/".into(), "/pizza".into()],
            },
            RelayRecord {
                url: "wss://a.example".into(),
                groups: vec!["/".into()],
            },
        ];
        save_relays(dir.path(), &relays).unwrap();
        assert_eq!(load_relays(dir.path()).unwrap(), relays);
    }

    #[test]
    fn groups_default_to_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("relays.json"), r#"[{"url":"wss://r"}]"#).unwrap();
        let relays = load_relays(dir.path()).unwrap();
        assert_eq!(relays[0].groups, Vec::<String>::new());
    }

    #[test]
    fn corrupt_relays_file_errors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("relays.json"), "{").unwrap();
        assert!(load_relays(dir.path()).is_err());
    }

    #[test]
    fn identity_is_private_and_cleared() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("state");
        assert_eq!(load_identity(&root).unwrap(), None);
        save_identity(&root, "abcd").unwrap();
        assert_eq!(load_identity(&root).unwrap().as_deref(), Some("abcd"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(root.join("identity.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        save_relays(&root, &[]).unwrap();
        clear(&root).unwrap();
        assert_eq!(load_identity(&root).unwrap(), None);
        assert!(!root.join("relays.json").exists());
        clear(&root).unwrap();
    }
}
