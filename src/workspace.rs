//! On-disk layout bootstrap and the single-instance lock.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::acl::ACL_FILE_NAME;

/// Relative directories every data dir carries.
const LAYOUT_DIRS: &[&str] = &["apps", ".data", "datasites"];

const LOCK_FILE_NAME: &str = "syftbox.lock";

/// Seeded into `datasites/<owner>/syft.pub.yaml`: nothing shared until the
/// owner says so.
const OWNER_ONLY_RULES: &str = "terminal: false
rules:
  - pattern: '**'
    access:
      admin: []
      write: []
      read: []
";

/// Seeded into `datasites/<owner>/public/syft.pub.yaml`: world-readable.
const PUBLIC_READ_RULES: &str = "terminal: false
rules:
  - pattern: '**'
    access:
      admin: []
      write: []
      read: ['*']
";

/// Create the directory skeleton and the two default rulesets for a fresh
/// data dir. Idempotent: existing ACL files are left exactly as the user
/// last edited them.
pub fn ensure_workspace_layout(data_dir: &Path, email: &str) -> Result<()> {
    for rel in LAYOUT_DIRS {
        let dir = data_dir.join(rel);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }

    let owner_root = data_dir.join("datasites").join(email);
    let public = owner_root.join("public");
    fs::create_dir_all(&public).with_context(|| format!("create {}", public.display()))?;

    seed_ruleset(&owner_root, OWNER_ONLY_RULES)?;
    seed_ruleset(&public, PUBLIC_READ_RULES)?;
    Ok(())
}

fn seed_ruleset(dir: &Path, rules: &str) -> Result<()> {
    let path = dir.join(ACL_FILE_NAME);
    if path.exists() {
        return Ok(());
    }
    fs::write(&path, rules).with_context(|| format!("write {}", path.display()))
}

/// Another daemon already owns this data dir.
#[derive(Debug)]
pub struct WorkspaceLockedError;

impl std::fmt::Display for WorkspaceLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "workspace locked by another process")
    }
}

impl std::error::Error for WorkspaceLockedError {}

/// Advisory exclusive lock on the data dir, held for the daemon's lifetime.
/// A stale lock file after a crash is harmless: the flock itself died with
/// the process, so the next start re-acquires cleanly.
#[derive(Debug)]
pub struct WorkspaceLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn try_lock(data_dir: &Path) -> Result<Self> {
        let meta = data_dir.join(".data");
        fs::create_dir_all(&meta).with_context(|| format!("create {}", meta.display()))?;
        let path = meta.join(LOCK_FILE_NAME);
        let file = sys::acquire(&path)?;
        Ok(Self { file, path })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        sys::release(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
mod sys {
    use super::WorkspaceLockedError;
    use anyhow::{Context, Result};
    use std::fs;
    use std::os::fd::AsRawFd;
    use std::path::Path;

    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }

    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    const LOCK_UN: i32 = 8;

    pub fn acquire(path: &Path) -> Result<fs::File> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;

        if unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) } == 0 {
            return Ok(file);
        }
        let err = std::io::Error::last_os_error();
        // EWOULDBLOCK is 11 on Linux, 35 on macOS.
        let busy = err.kind() == std::io::ErrorKind::WouldBlock
            || matches!(err.raw_os_error(), Some(11) | Some(35));
        if busy {
            Err(WorkspaceLockedError.into())
        } else {
            Err(err).context("flock")
        }
    }

    pub fn release(file: &fs::File) {
        unsafe {
            flock(file.as_raw_fd(), LOCK_UN);
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::WorkspaceLockedError;
    use anyhow::{Context, Result};
    use std::fs;
    use std::path::Path;

    // No flock: exclusivity comes from atomically creating the lock file,
    // which Drop removes again.
    pub fn acquire(path: &Path) -> Result<fs::File> {
        match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(WorkspaceLockedError.into())
            }
            Err(e) => Err(e).with_context(|| format!("open {}", path.display())),
        }
    }

    pub fn release(_file: &fs::File) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-ws-test-{name}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn layout_creates_skeleton_and_default_rulesets() {
        let tmp = make_temp_dir("layout");
        ensure_workspace_layout(&tmp, "alice@example.com").unwrap();

        for rel in LAYOUT_DIRS {
            assert!(tmp.join(rel).is_dir(), "missing {rel}");
        }
        let owner_root = tmp.join("datasites/alice@example.com");
        let root_rules = fs::read_to_string(owner_root.join(ACL_FILE_NAME)).unwrap();
        assert!(root_rules.contains("read: []"));
        let public_rules =
            fs::read_to_string(owner_root.join("public").join(ACL_FILE_NAME)).unwrap();
        assert!(public_rules.contains("read: ['*']"));
    }

    #[test]
    fn layout_never_clobbers_edited_rulesets() {
        let tmp = make_temp_dir("idempotent");
        ensure_workspace_layout(&tmp, "alice@example.com").unwrap();

        let acl = tmp.join("datasites/alice@example.com").join(ACL_FILE_NAME);
        fs::write(&acl, "# hand edited\n").unwrap();
        ensure_workspace_layout(&tmp, "alice@example.com").unwrap();
        assert_eq!(fs::read_to_string(&acl).unwrap(), "# hand edited\n");
    }

    #[test]
    fn second_lock_attempt_reports_locked_until_released() {
        let tmp = make_temp_dir("lock");

        let held = WorkspaceLock::try_lock(&tmp).unwrap();
        let err = WorkspaceLock::try_lock(&tmp).unwrap_err();
        assert!(
            err.chain().any(|c| c.is::<WorkspaceLockedError>()),
            "expected WorkspaceLockedError, got: {err:#}"
        );

        drop(held);
        WorkspaceLock::try_lock(&tmp).unwrap();
    }
}
