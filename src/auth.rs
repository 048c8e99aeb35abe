// SPDX-License-Identifier: MIT
//! Authorities validate client credentials and yield a maximum access level.
//!
//! Only one authority is built in: `password`, backed by an htpasswd-style
//! file (`user:hash`, 13-character crypt(3) DES hashes) and a group file
//! (`level:::user1,user2,...`).  Both files are re-read whenever their mtime
//! says they changed; a snapshot is only replaced after a full, successful
//! parse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::AccessLevel;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed credentials")]
    BadCredentials,
    #[error("unknown user")]
    UnknownUser,
    #[error("password mismatch")]
    HashMismatch,
}

/// A pluggable credential validator, addressed by name in the `authorize`
/// server command.
pub trait Authority: Send {
    fn name(&self) -> &'static str;

    /// Validate `credentials` and return the user's maximum access level.
    fn authorize(&mut self, credentials: &str) -> Result<AccessLevel, AuthError>;
}

#[derive(Debug, Clone)]
struct UserInfo {
    hash: String,
    level: AccessLevel,
}

/// The `password` authority.
pub struct PasswordAuth {
    htpasswd_file: PathBuf,
    group_file: PathBuf,
    users: HashMap<String, UserInfo>,
    last_refresh: SystemTime,
    reloads: u64,
}

impl PasswordAuth {
    /// Load the credential files. Startup fails if either file is unreadable
    /// or malformed; later refresh failures keep the current snapshot.
    pub fn open(htpasswd_file: &Path, group_file: &Path) -> anyhow::Result<Self> {
        let users = read_credential_files(htpasswd_file, group_file)
            .with_context(|| format!("loading credentials from {}", htpasswd_file.display()))?;
        info!(users = users.len(), "password authority loaded");
        Ok(Self {
            htpasswd_file: htpasswd_file.to_path_buf(),
            group_file: group_file.to_path_buf(),
            users,
            last_refresh: SystemTime::now(),
            reloads: 0,
        })
    }

    /// Re-read the credential files if either has an mtime at or after the
    /// last refresh. Parse errors retain the previous snapshot.
    fn refresh_file_cache(&mut self) {
        let changed = [&self.htpasswd_file, &self.group_file].iter().any(|f| {
            match std::fs::metadata(f).and_then(|m| m.modified()) {
                Ok(mtime) => mtime >= self.last_refresh,
                Err(e) => {
                    warn!(file = %f.display(), error = %e, "couldn't stat credential file");
                    false
                }
            }
        });
        if !changed {
            return;
        }
        self.last_refresh = SystemTime::now();
        match read_credential_files(&self.htpasswd_file, &self.group_file) {
            Ok(users) => {
                self.reloads += 1;
                debug!(users = users.len(), reloads = self.reloads, "credential cache refreshed");
                self.users = users;
            }
            Err(e) => warn!(error = %e, "credential reload failed, keeping previous snapshot"),
        }
    }
}

impl Authority for PasswordAuth {
    fn name(&self) -> &'static str {
        "password"
    }

    /// `credentials` is `user:password`.
    fn authorize(&mut self, credentials: &str) -> Result<AccessLevel, AuthError> {
        self.refresh_file_cache();

        let (user, password) = credentials
            .trim_end()
            .split_once(':')
            .ok_or(AuthError::BadCredentials)?;
        if user.is_empty() || password.is_empty() {
            debug!("invalid credentials string");
            return Err(AuthError::BadCredentials);
        }

        let info = self.users.get(user).ok_or_else(|| {
            debug!(user, "unknown user");
            AuthError::UnknownUser
        })?;

        // crypt() the password with the stored hash as salt and compare
        // byte-for-byte.
        let crypted = pwhash::unix::crypt(password, &info.hash).map_err(|_| AuthError::HashMismatch)?;
        if crypted != info.hash {
            info!(user, "authorization failure");
            return Err(AuthError::HashMismatch);
        }

        info!(user, level = %info.level, "authorization success");
        Ok(info.level)
    }
}

fn read_credential_files(
    htpasswd_file: &Path,
    group_file: &Path,
) -> anyhow::Result<HashMap<String, UserInfo>> {
    let mut users = HashMap::new();

    let passwd = std::fs::read_to_string(htpasswd_file)
        .with_context(|| format!("couldn't open {}", htpasswd_file.display()))?;
    for line in passwd.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.trim_end().split(':').collect();
        if fields.len() != 2 || fields[0].is_empty() || fields[1].len() != 13 {
            anyhow::bail!("invalid line in htpasswd file");
        }
        users.insert(
            fields[0].to_string(),
            UserInfo {
                hash: fields[1].to_string(),
                level: AccessLevel::Read,
            },
        );
    }

    let groups = std::fs::read_to_string(group_file)
        .with_context(|| format!("couldn't open {}", group_file.display()))?;
    for line in groups.lines().filter(|l| !l.trim().is_empty()) {
        // level:::user1,user2,...
        let fields: Vec<&str> = line.trim_end().split(':').collect();
        if fields.len() != 4 || fields[0].is_empty() {
            anyhow::bail!("invalid line in group file");
        }
        let level: AccessLevel = fields[0]
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid access level '{}' in group file", fields[0]))?;

        // A user may appear in several groups; keep the maximum level.
        for member in fields[3].split(',').filter(|m| !m.is_empty()) {
            if let Some(info) = users.get_mut(member) {
                if level > info.level {
                    info.level = level;
                }
            }
        }
    }

    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn des_hash(password: &str) -> String {
        pwhash::unix_crypt::hash_with("ab", password).unwrap()
    }

    fn write_files(dir: &TempDir, passwd: &str, groups: &str) -> (PathBuf, PathBuf) {
        let p = dir.path().join("gspasswd.conf");
        let g = dir.path().join("gsgroups.conf");
        std::fs::File::create(&p)
            .unwrap()
            .write_all(passwd.as_bytes())
            .unwrap();
        std::fs::File::create(&g)
            .unwrap()
            .write_all(groups.as_bytes())
            .unwrap();
        (p, g)
    }

    #[test]
    fn authorizes_with_maximum_group_level() {
        let dir = TempDir::new().unwrap();
        let passwd = format!("alice:{}\nbob:{}\n", des_hash("secret"), des_hash("hunter2"));
        let groups = "write:::alice,bob\nadmin:::alice\n";
        let (p, g) = write_files(&dir, &passwd, groups);

        let mut auth = PasswordAuth::open(&p, &g).unwrap();
        assert_eq!(auth.authorize("alice:secret").unwrap(), AccessLevel::Admin);
        assert_eq!(auth.authorize("bob:hunter2").unwrap(), AccessLevel::Write);
    }

    #[test]
    fn rejects_bad_credentials() {
        let dir = TempDir::new().unwrap();
        let passwd = format!("alice:{}\n", des_hash("secret"));
        let (p, g) = write_files(&dir, &passwd, "read:::alice\n");

        let mut auth = PasswordAuth::open(&p, &g).unwrap();
        assert!(matches!(
            auth.authorize("no-colon-here"),
            Err(AuthError::BadCredentials)
        ));
        assert!(matches!(
            auth.authorize("mallory:secret"),
            Err(AuthError::UnknownUser)
        ));
        assert!(matches!(
            auth.authorize("alice:wrong"),
            Err(AuthError::HashMismatch)
        ));
    }

    #[test]
    fn repeated_authorize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let passwd = format!("alice:{}\n", des_hash("secret"));
        let (p, g) = write_files(&dir, &passwd, "admin:::alice\n");

        let mut auth = PasswordAuth::open(&p, &g).unwrap();
        let first = auth.authorize("alice:secret").unwrap();
        for _ in 0..3 {
            assert_eq!(auth.authorize("alice:secret").unwrap(), first);
        }
    }

    #[test]
    fn unchanged_files_are_not_reparsed() {
        let dir = TempDir::new().unwrap();
        let passwd = format!("alice:{}\n", des_hash("secret"));
        let (p, g) = write_files(&dir, &passwd, "admin:::alice\n");

        // Coarse filesystem clocks can make the write mtime tie with the load
        // timestamp; step past it so the mtimes are strictly older.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut auth = PasswordAuth::open(&p, &g).unwrap();
        auth.authorize("alice:secret").unwrap();
        auth.authorize("alice:secret").unwrap();
        assert_eq!(auth.reloads, 0);
    }

    #[test]
    fn changed_file_triggers_reload() {
        let dir = TempDir::new().unwrap();
        let passwd = format!("alice:{}\n", des_hash("secret"));
        let (p, g) = write_files(&dir, &passwd, "admin:::alice\n");

        let mut auth = PasswordAuth::open(&p, &g).unwrap();
        // Rewrite the htpasswd file with a new user; the mtime moves past the
        // last refresh and the next authorize must see the new snapshot.
        let passwd = format!("alice:{}\ncarol:{}\n", des_hash("secret"), des_hash("pw"));
        std::fs::write(&p, passwd).unwrap();
        assert_eq!(auth.authorize("carol:pw").unwrap(), AccessLevel::Read);
        assert!(auth.reloads >= 1);
    }

    #[test]
    fn parse_failure_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let passwd = format!("alice:{}\n", des_hash("secret"));
        let (p, g) = write_files(&dir, &passwd, "admin:::alice\n");

        let mut auth = PasswordAuth::open(&p, &g).unwrap();
        std::fs::write(&p, "garbage line without fields\n").unwrap();
        // Reload is attempted and fails; alice survives from the old snapshot.
        assert_eq!(auth.authorize("alice:secret").unwrap(), AccessLevel::Admin);
    }

    #[test]
    fn startup_fails_on_missing_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.conf");
        assert!(PasswordAuth::open(&missing, &missing).is_err());
    }
}
