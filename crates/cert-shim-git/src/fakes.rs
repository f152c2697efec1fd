//! In-memory fake of [`Repository`] (testing only)
//!
//! `FakeRepository` models a clone and its remote as lists of commit ids.
//! Its working tree is whatever files exist under its local path plus any
//! paths marked with [`FakeRepository::modify`]. Pushes can be scripted to
//! be rejected, and every rejection moves the remote ahead the way a
//! concurrent writer would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::GitError;
use crate::options::DEFAULT_BRANCH;
use crate::repository::Repository;
use crate::Result;

/// One commit created through the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCommit {
    pub id: String,
    pub message: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct State {
    remote: Vec<String>,
    tracking: Vec<String>,
    base: Vec<String>,
    unpushed: Vec<String>,
    dirty: Vec<PathBuf>,
    staged: Vec<PathBuf>,
    committed: HashMap<PathBuf, Vec<u8>>,
    log: Vec<FakeCommit>,
    reject_pushes: usize,
    push_error: Option<GitError>,
    next_id: usize,
    clones: usize,
    fetches: usize,
    pulls: usize,
    pushes: usize,
}

/// In-memory repository and remote. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeRepository {
    path: PathBuf,
    branch: String,
    state: Arc<Mutex<State>>,
}

impl FakeRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let state = State {
            remote: vec!["remote-0".to_string()],
            next_id: 1,
            ..State::default()
        };
        FakeRepository {
            path: path.into(),
            branch: DEFAULT_BRANCH.to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `path` as modified in the working tree.
    pub fn modify(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut s = self.state();
        if !s.dirty.contains(&path) {
            s.dirty.push(path);
        }
    }

    /// Add a foreign commit to the remote.
    pub fn advance_remote(&self) {
        let mut s = self.state();
        let id = format!("remote-{}", s.next_id);
        s.next_id += 1;
        s.remote.push(id);
    }

    /// Reject the next `n` pushes as non-fast-forward.
    pub fn reject_next_pushes(&self, n: usize) {
        self.state().reject_pushes = n;
    }

    /// Fail the next push with `err`.
    pub fn fail_next_push(&self, err: GitError) {
        self.state().push_error = Some(err);
    }

    pub fn commit_log(&self) -> Vec<FakeCommit> {
        self.state().log.clone()
    }

    pub fn remote_commits(&self) -> Vec<String> {
        self.state().remote.clone()
    }

    pub fn clones(&self) -> usize {
        self.state().clones
    }

    pub fn fetches(&self) -> usize {
        self.state().fetches
    }

    pub fn pull_rebases(&self) -> usize {
        self.state().pulls
    }

    pub fn pushes(&self) -> usize {
        self.state().pushes
    }

    fn changed_on_disk(state: &State, path: &Path) -> bool {
        match std::fs::read(path) {
            Ok(content) => state.committed.get(path) != Some(&content),
            Err(_) => false,
        }
    }

    fn disk_changes(&self, state: &State) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        let mut dirs = vec![self.path.clone()];
        while let Some(dir) = dirs.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if entry.file_name() != ".git" {
                        dirs.push(path);
                    }
                } else if Self::changed_on_disk(state, &path) {
                    changed.push(path);
                }
            }
        }
        changed
    }

    fn conflict() -> GitError {
        GitError::CommandFailed {
            command: "git push".to_string(),
            code: 1,
            stderr: "! [rejected] HEAD -> master (fetch first)\nerror: failed to push some refs"
                .to_string(),
        }
        .context("git push")
    }
}

#[async_trait]
impl Repository for FakeRepository {
    fn local_path(&self) -> &Path {
        &self.path
    }

    fn branch(&self) -> &str {
        &self.branch
    }

    async fn clone_remote(&self) -> Result<()> {
        let mut s = self.state();
        s.clones += 1;
        s.base = s.remote.clone();
        s.tracking = s.remote.clone();
        Ok(())
    }

    async fn status(&self) -> Result<String> {
        let s = self.state();
        let lines: Vec<String> = s
            .dirty
            .iter()
            .chain(self.disk_changes(&s).iter())
            .map(|p| format!(" M {}", p.display()))
            .chain(s.staged.iter().map(|p| format!("M  {}", p.display())))
            .collect();
        Ok(lines.join("\n"))
    }

    async fn add(&self, files: &[PathBuf]) -> Result<()> {
        let mut s = self.state();
        for file in files {
            let was_dirty = match s.dirty.iter().position(|p| p == file) {
                Some(i) => {
                    s.dirty.remove(i);
                    true
                }
                None => false,
            };
            if (was_dirty || Self::changed_on_disk(&s, file)) && !s.staged.contains(file) {
                s.staged.push(file.clone());
            }
        }
        Ok(())
    }

    async fn staged_files(&self) -> Result<Vec<String>> {
        Ok(self
            .state()
            .staged
            .iter()
            .map(|p| p.display().to_string())
            .collect())
    }

    async fn commit(&self, message: &str) -> Result<()> {
        let mut s = self.state();
        if s.staged.is_empty() {
            return Err(GitError::CommandFailed {
                command: "git commit".to_string(),
                code: 1,
                stderr: "nothing to commit, working tree clean".to_string(),
            }
            .context("git commit"));
        }
        let id = format!("local-{}", s.next_id);
        s.next_id += 1;
        let files = std::mem::take(&mut s.staged);
        for file in &files {
            if let Ok(content) = std::fs::read(file) {
                s.committed.insert(file.clone(), content);
            }
        }
        s.unpushed.push(id.clone());
        s.log.push(FakeCommit {
            id,
            message: message.to_string(),
            files,
        });
        Ok(())
    }

    async fn push(&self) -> Result<()> {
        let mut s = self.state();
        s.pushes += 1;
        if let Some(err) = s.push_error.take() {
            return Err(err.context("git push"));
        }
        if s.reject_pushes > 0 {
            s.reject_pushes -= 1;
            let id = format!("remote-{}", s.next_id);
            s.next_id += 1;
            s.remote.push(id);
            return Err(Self::conflict());
        }
        if s.base != s.remote {
            return Err(Self::conflict());
        }
        let unpushed = std::mem::take(&mut s.unpushed);
        s.remote.extend(unpushed);
        s.base = s.remote.clone();
        Ok(())
    }

    async fn fetch(&self) -> Result<()> {
        let mut s = self.state();
        s.fetches += 1;
        s.tracking = s.remote.clone();
        Ok(())
    }

    async fn pull_rebase(&self) -> Result<()> {
        let mut s = self.state();
        s.pulls += 1;
        s.base = s.tracking.clone();
        Ok(())
    }

    async fn head_commit_hash(&self) -> Result<String> {
        let s = self.state();
        Ok(s.unpushed
            .last()
            .or_else(|| s.base.last())
            .cloned()
            .unwrap_or_default())
    }

    async fn remote_tracking_hash(&self) -> Result<String> {
        Ok(self.state().tracking.last().cloned().unwrap_or_default())
    }

    async fn clear_stale_index_lock(&self) -> Result<bool> {
        Ok(false)
    }
}
