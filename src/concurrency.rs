//! Lock-file discipline for node mutations
//!
//! Every node has a lock file next to it. Any read-modify-write of a node's
//! attributes holds an exclusive advisory lock on that file for the whole
//! window. Locks are released when the guard is dropped, on every exit path.
//!
//! Whenever more than one node lock is needed at once they are taken through
//! `LockSet`, which acquires them in ascending lock file path order. The only
//! other nesting allowed is taking the lock of a node that was created under
//! the held lock (a fresh child or a revision of the locked node), which no
//! other thread can be waiting for.
//!
//! `ScopedMutation` pairs a held lock with a log of compensating actions so
//! multi-step mutations can undo their externally visible artifacts when they
//! fail before committing.

use crate::error::StorageError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// An open lock file holding an advisory lock until dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

fn open_lockfile(path: &Path, create: bool) -> Result<File, StorageError> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(create);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotExist(path.to_path_buf())
        } else {
            StorageError::Io(e)
        }
    })
}

impl LockedFile {
    /// Open (creating if needed) and exclusively lock `path`. Blocks until granted.
    pub fn exclusive(path: &Path) -> Result<Self, StorageError> {
        let file = open_lockfile(path, true)?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| StorageError::Lock(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Exclusively lock an already existing lock file.
    pub fn exclusive_existing(path: &Path) -> Result<Self, StorageError> {
        let file = open_lockfile(path, false)?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| StorageError::Lock(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open (creating if needed) and take a shared lock on `path`.
    pub fn shared(path: &Path) -> Result<Self, StorageError> {
        let file = open_lockfile(path, true)?;
        FileExt::lock_shared(&file)
            .map_err(|e| StorageError::Lock(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Try to take an exclusive lock without blocking. `None` when contended.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>, StorageError> {
        let file = open_lockfile(path, true)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(StorageError::Lock(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lockfile = %self.path.display(), "could not release lock: {}", e);
        }
    }
}

/// Several exclusive locks taken in one global order.
///
/// Paths are sorted and deduplicated before locking, so two threads asking
/// for overlapping sets always contend on the lowest shared path first.
#[derive(Debug)]
pub struct LockSet {
    locks: Vec<LockedFile>,
}

impl LockSet {
    pub fn exclusive<P: AsRef<Path>>(paths: &[P]) -> Result<Self, StorageError> {
        let mut sorted: Vec<&Path> = paths.iter().map(AsRef::as_ref).collect();
        sorted.sort();
        sorted.dedup();
        let mut locks = Vec::with_capacity(sorted.len());
        for path in sorted {
            locks.push(LockedFile::exclusive(path)?);
        }
        Ok(Self { locks })
    }

    /// The held lock on `path`, if it is part of the set.
    pub fn get(&self, path: &Path) -> Option<&LockedFile> {
        self.locks.iter().find(|lock| lock.path() == path)
    }

    /// Give up the set, keeping only the lock on `path`.
    pub fn keep(self, path: &Path) -> Option<LockedFile> {
        self.locks.into_iter().find(|lock| lock.path() == path)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

type UndoAction<'a> = Box<dyn FnOnce() -> Result<(), StorageError> + 'a>;

/// A held node lock plus the compensating actions for the steps done under it.
///
/// Dropping without `commit` runs the registered actions in reverse order while
/// the lock is still held, then releases the lock. Failures of compensating
/// actions are logged, never raised.
pub struct ScopedMutation<'a> {
    lock: Option<LockedFile>,
    undo: Vec<(String, UndoAction<'a>)>,
    committed: bool,
}

impl<'a> ScopedMutation<'a> {
    pub fn begin(lock: LockedFile) -> Self {
        Self {
            lock: Some(lock),
            undo: Vec::new(),
            committed: false,
        }
    }

    /// The lock this mutation runs under.
    pub fn lock(&self) -> &LockedFile {
        // only taken in commit(), which consumes self
        self.lock.as_ref().unwrap_or_else(|| unreachable!("lock taken before commit"))
    }

    /// Register an action undoing the step that was just performed.
    pub fn on_rollback<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), StorageError> + 'a,
    {
        self.undo.push((label.into(), Box::new(action)));
    }

    /// Number of registered compensating actions.
    pub fn pending_rollbacks(&self) -> usize {
        self.undo.len()
    }

    /// Keep every step. Returns the still held lock to the caller.
    pub fn commit(mut self) -> LockedFile {
        self.committed = true;
        self.undo.clear();
        match self.lock.take() {
            Some(lock) => lock,
            None => unreachable!("lock taken twice"),
        }
    }

    fn rollback(&mut self) {
        while let Some((label, action)) = self.undo.pop() {
            if let Err(e) = action() {
                tracing::error!(step = %label, "rollback step failed: {}", e);
            } else {
                tracing::debug!(step = %label, "rolled back");
            }
        }
    }
}

impl Drop for ScopedMutation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}
