//! Record store: the local records and the simulated authority on disk.
//!
//! Records are kept as one JSON document keyed by group. Writers hold an
//! exclusive `flock` on a sibling `.lock` file for the whole run, so two
//! drivers never interleave their updates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use roster_core::{AuthorityState, GroupHandle, LocalRecord, MembershipDeclaration};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CliError;


// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// Local records of every group this driver manages.
#[derive(Debug, Default)]
pub struct RecordStore {
    path: PathBuf,
    records: BTreeMap<GroupHandle, LocalRecord>,
}


impl RecordStore {
    /// Load the store. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let records = if path.exists() {
            read_json(path)?
        } else {
            BTreeMap::new()
        };
        Ok(RecordStore {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn get(&self, group: &GroupHandle) -> Option<&LocalRecord> {
        self.records.get(group)
    }

    pub fn put(&mut self, record: LocalRecord) {
        self.records.insert(record.group.clone(), record);
    }

    pub fn remove(&mut self, group: &GroupHandle) -> Option<LocalRecord> {
        self.records.remove(group)
    }

    pub fn groups(&self) -> Vec<GroupHandle> {
        self.records.keys().cloned().collect()
    }

    pub fn save(&self) -> Result<(), CliError> {
        write_json(&self.path, &self.records)
    }
}


// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Load the simulated authority. A missing file is an empty authority.
pub fn load_authority(path: &Path) -> Result<AuthorityState, CliError> {
    if !path.exists() {
        return Ok(AuthorityState::default());
    }
    read_json(path)
}


pub fn save_authority(path: &Path, state: &AuthorityState) -> Result<(), CliError> {
    write_json(path, state)
}


/// Load the desired-state file: a YAML sequence of declarations.
pub fn load_declarations(path: &Path) -> Result<Vec<MembershipDeclaration>, CliError> {
    let content = std::fs::read_to_string(path).map_err(|e| CliError::io(path, e))?;
    serde_yaml::from_str(&content).map_err(|source| CliError::Yaml {
        path: path.display().to_string(),
        source,
    })
}


fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let content = std::fs::read_to_string(path).map_err(|e| CliError::io(path, e))?;
    serde_json::from_str(&content).map_err(|source| CliError::Json {
        path: path.display().to_string(),
        source,
    })
}


/// Write via a temporary sibling and rename, so readers never see a torn file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CliError> {
    let content = serde_json::to_string_pretty(value).map_err(|source| CliError::Json {
        path: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(|e| CliError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| CliError::io(path, e))
}


// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

/// File-lock guard that releases the lock on drop. The lock file itself
/// stays, so every process always locks the same inode.
#[derive(Debug)]
pub struct LockGuard {
    file: std::fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(
                std::os::unix::io::AsRawFd::as_raw_fd(&self.file),
                libc::LOCK_UN,
            );
        }
    }
}


/// Take the exclusive lock guarding `store_path`, waiting up to `timeout_ms`.
pub fn acquire_lock(store_path: &Path, timeout_ms: u64) -> Result<LockGuard, CliError> {
    let lock_path = store_path.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| CliError::io(parent, e))?;
        }
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| CliError::io(&lock_path, e))?;

    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(LockGuard { file });
        }

        if Instant::now() >= deadline {
            return Err(CliError::Locked {
                path: lock_path.display().to_string(),
                timeout_ms,
            });
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::{DesiredMembership, MemberSpace};

    fn record(group: &str, names: &[&str]) -> LocalRecord {
        let desired = DesiredMembership::from_names(GroupHandle::new(group), names).unwrap();
        LocalRecord::from(&desired)
    }

    #[test]
    fn missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::load(&dir.path().join("records.json")).unwrap();
        assert!(store.groups().is_empty());
    }

    #[test]
    fn records_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let mut store = RecordStore::load(&path).unwrap();
        store.put(record("g1", &["alice"]));
        store.put(record("g2", &["bob", "carol"]));
        store.save().unwrap();

        let mut again = RecordStore::load(&path).unwrap();
        assert_eq!(again.groups().len(), 2);
        let g2 = again.get(&GroupHandle::new("g2")).unwrap();
        assert_eq!(g2.space, MemberSpace::Name);
        assert_eq!(g2.members.len(), 2);

        again.remove(&GroupHandle::new("g1"));
        again.save().unwrap();
        assert_eq!(RecordStore::load(&path).unwrap().groups(), vec![GroupHandle::new("g2")]);
    }

    #[test]
    fn corrupt_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RecordStore::load(&path), Err(CliError::Json { .. })));
    }

    #[test]
    fn declarations_parse_both_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desired.yaml");
        std::fs::write(
            &path,
            "- group_id: eng\n  user_names: [alice, bob]\n- group_id: ops\n  user_ids: [\"100\"]\n",
        )
        .unwrap();
        let decls = load_declarations(&path).unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].user_names.as_ref().unwrap().len(), 2);
        assert!(decls[1].user_names.is_none());
    }

    #[test]
    fn authority_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authority.json");
        assert_eq!(load_authority(&path).unwrap(), AuthorityState::default());

        let mut state = AuthorityState::default();
        state
            .users
            .insert("alice".into(), roster_core::Identifier::new("1"));
        save_authority(&path, &state).unwrap();
        assert_eq!(load_authority(&path).unwrap(), state);
    }

    #[test]
    fn second_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let held = acquire_lock(&path, 1_000).unwrap();
        let err = acquire_lock(&path, 100).unwrap_err();
        assert!(matches!(err, CliError::Locked { .. }));
        drop(held);
        assert!(path.with_extension("lock").exists());
        assert!(acquire_lock(&path, 100).is_ok());
    }
}
