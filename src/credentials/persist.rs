//! On-disk form of the credential store.
//!
//! The file holds the signing key, unrevoked sessions and known identities as
//! JSON. Writes go to a sibling `.tmp` file which is then renamed over the
//! target, so readers only ever see a complete document.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Identity, Session};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateFile {
    /// Standard base64 of the HMAC key.
    #[serde(default)]
    pub signing_key: String,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub identities: Vec<Identity>,
}

/// Read a state file. `Ok(None)` if it does not exist.
pub fn load(path: &Path) -> std::io::Result<Option<StateFile>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let state = serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(state))
}

/// Write `state` to `path` via temp file + rename. The file is created
/// owner-only on unix.
pub fn save(path: &Path, state: &StateFile) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let result = (|| {
        let mut file = options.open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Resolve `path` against `root` and return it only if it stays inside.
///
/// Relative paths are taken relative to `root`. `..` components are resolved
/// lexically, so `root/a/../../x` is rejected.
pub fn confine(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = normalize(&absolute(root)?);
    let candidate = if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&root.join(path))
    };
    (candidate.starts_with(&root) && candidate != root).then_some(candidate)
}

fn absolute(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(path))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
