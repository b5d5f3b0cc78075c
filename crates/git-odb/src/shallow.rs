//! The `shallow` file: newline-separated hex object ids marking commits
//! whose parents were intentionally omitted from a partial fetch.
//!
//! Lives next to the `objects` directory (i.e. at `<git_dir>/shallow`), same
//! layout convention C git uses. Absence of the file means a complete
//! (non-shallow) repository.

use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use git_hash::ObjectId;
use git_utils::lockfile::LockFile;

use crate::OdbError;

pub(crate) fn shallow_path(git_dir: &Path) -> PathBuf {
    git_dir.join("shallow")
}

/// Read the shallow file. Returns an empty set if it does not exist.
pub(crate) fn read_shallow(git_dir: &Path) -> Result<HashSet<ObjectId>, OdbError> {
    let path = shallow_path(git_dir);
    if !path.exists() {
        return Ok(HashSet::new());
    }

    let data = fs::read_to_string(&path)?;
    let mut set = HashSet::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let oid = ObjectId::from_hex(line)
            .map_err(|e| OdbError::ShallowFile(format!("invalid hex id {line:?}: {e}")))?;
        set.insert(oid);
    }
    Ok(set)
}

/// Write the shallow file atomically. An empty set removes the file
/// entirely, matching C git's behavior once a repository becomes complete.
pub(crate) fn write_shallow(git_dir: &Path, ids: &HashSet<ObjectId>) -> Result<(), OdbError> {
    let path = shallow_path(git_dir);

    if ids.is_empty() {
        if path.exists() {
            fs::remove_file(&path)?;
        }
        return Ok(());
    }

    let mut sorted: Vec<&ObjectId> = ids.iter().collect();
    sorted.sort();

    let mut lock = LockFile::acquire(&path)?;
    for id in sorted {
        writeln!(lock, "{}", id.to_hex())?;
    }
    lock.commit()?;
    Ok(())
}
