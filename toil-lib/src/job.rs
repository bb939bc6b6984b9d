// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Workflow and job execution contexts
//!
//! A [`Workflow`] owns the shared tokio runtime and the file store and
//! hands out [`Job`]s. A job carries scratch space, the resource envelope
//! tool wrappers size themselves against, per tool wall-clock accounting
//! and a stack of deferred cleanups that runs newest-first on drop.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use std::{fmt, io};

use fs_err as fs;
use thiserror::Error;

use crate::env::Env;
use crate::paths::{Id, Paths};
use crate::programs::{self, Defer};
use crate::store::{FileId, FileStore};
use crate::timing::{fmt_elapsed, Timer, Timing};
use crate::{runtime, store, util};

/// Resource envelope of a job, mirrored into tool invocations
/// as `-Xmx`, thread counts and transfer slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cores: NonZeroUsize,
    /// Bytes
    pub memory: u64,
    /// Bytes
    pub disk: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: util::num_cpus(),
            memory: 2 * 1024 * 1024 * 1024,
            disk: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl Resources {
    /// `-Xmx` flag handed to jvm tools, as a raw byte count
    pub fn xmx(&self) -> String {
        format!("-Xmx{}", self.memory)
    }
}

/// One workflow run rooted in the shared cache
pub struct Workflow {
    paths: Paths,
    store: FileStore,
    mock: bool,
    _runtime: runtime::Guard,
}

impl Workflow {
    /// Standard workflow, mock mode read from the environment
    pub fn new(name: &str, env: &Env) -> io::Result<Self> {
        Self::create(name, env, programs::mock_mode())
    }

    /// Workflow with every tool container stubbed out, for exercising
    /// pipeline plumbing without images or a docker daemon
    pub fn mocked(name: &str, env: &Env) -> io::Result<Self> {
        Self::create(name, env, true)
    }

    fn create(name: &str, env: &Env, mock: bool) -> io::Result<Self> {
        let _runtime = runtime::init();
        let paths = Paths::new(Id::generate(name), &env.cache_dir, "/data")?;
        let store = FileStore::open(paths.store().host)?;

        Ok(Self {
            paths,
            store,
            mock,
            _runtime,
        })
    }

    pub fn id(&self) -> &Id {
        self.paths.id()
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    /// New job with default resources
    pub fn job(&self, name: &str) -> io::Result<Job> {
        self.job_with(name, Resources::default())
    }

    pub fn job_with(&self, name: &str, resources: Resources) -> io::Result<Job> {
        let id = Id::generate(name);
        let scratch = self.paths.scratch().host.join(id.as_str());
        util::ensure_dir_exists(&scratch)?;

        Ok(Job {
            id,
            workflow: self.id().clone(),
            resources,
            store: self.store.clone(),
            scratch,
            guest_root: self.paths.scratch().guest,
            downloads: self.paths.downloads().host,
            mock: self.mock,
            temp_counter: AtomicUsize::new(0),
            deferred: Mutex::new(vec![]),
            timing: Mutex::new(Timing::default()),
            _runtime: runtime::init(),
        })
    }

    /// Delete this workflow's scratch and store trees. The shared
    /// download cache stays.
    pub fn cleanup(self) -> io::Result<()> {
        fs::remove_dir_all(self.paths.scratch().host)?;
        fs::remove_dir_all(self.paths.store().host)?;
        Ok(())
    }
}

/// Execution context of one unit of work
pub struct Job {
    id: Id,
    workflow: Id,
    pub resources: Resources,
    store: FileStore,
    scratch: PathBuf,
    guest_root: PathBuf,
    downloads: PathBuf,
    mock: bool,
    temp_counter: AtomicUsize,
    deferred: Mutex<Vec<Cleanup>>,
    timing: Mutex<Timing>,
    _runtime: runtime::Guard,
}

impl Job {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn workflow_id(&self) -> &Id {
        &self.workflow
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads
    }

    /// Where work dirs appear inside tool containers
    pub fn guest_root(&self) -> &Path {
        &self.guest_root
    }

    /// Fresh unique directory under the job's scratch space
    pub fn temp_dir(&self) -> io::Result<PathBuf> {
        let n = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        let dir = self.scratch.join(format!("tmp{n}"));
        util::ensure_dir_exists(&dir)?;
        Ok(dir)
    }

    /// Add a local file to the workflow's store
    pub fn write_file(&self, path: &Path) -> Result<FileId, store::Error> {
        self.store.put(path)
    }

    /// Materialise a stored file at `dest`
    pub fn read_file(&self, id: &FileId, dest: &Path) -> Result<(), store::Error> {
        self.store.get(id, dest)
    }

    /// Defer a cleanup until the job drops. Cleanups run newest first,
    /// mirroring registration order of container kills before
    /// permission fixes.
    pub fn defer(&self, cleanup: Cleanup) {
        self.deferred.lock().expect("mutex lock").push(cleanup);
    }

    pub fn begin(&self, label: impl ToString) -> Timer {
        self.timing.lock().expect("mutex lock").begin(label)
    }

    /// Record the timer and log the elapsed wall time
    pub fn finish(&self, timer: Timer) -> Duration {
        let label = timer.label().to_owned();
        let elapsed = self.timing.lock().expect("mutex lock").finish(timer);

        log::info!("{label} ran in {}", fmt_elapsed(elapsed).trim_start());

        elapsed
    }

    pub fn print_runtimes(&self) {
        self.timing.lock().expect("mutex lock").print_table();
    }

    fn run_cleanups(&mut self) {
        let mut deferred = match self.deferred.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        while let Some(cleanup) = deferred.pop() {
            if let Err(e) = cleanup.run() {
                log::warn!("cleanup failed: {e}");
            }
        }
    }

    #[cfg(test)]
    fn drain_deferred(&self) -> Vec<Cleanup> {
        let mut deferred = self.deferred.lock().unwrap();
        let mut drained = vec![];
        while let Some(cleanup) = deferred.pop() {
            drained.push(cleanup);
        }
        drained
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.run_cleanups();

        if let Err(e) = fs::remove_dir_all(&self.scratch) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to remove job scratch: {e}");
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("workflow", &self.workflow)
            .field("resources", &self.resources)
            .field("mock", &self.mock)
            .finish_non_exhaustive()
    }
}

/// Deferred cleanup actions
#[derive(Debug, Clone)]
pub enum Cleanup {
    /// Apply a [`Defer`] policy to a named container
    Container { name: String, action: Defer },
    /// Chown a work dir back to the invoking user through the tool
    /// image. Container writes arrive owned by root.
    FixPermissions { image: String, work_dir: PathBuf },
    RemoveDir(PathBuf),
}

impl Cleanup {
    fn run(&self) -> Result<(), CleanupError> {
        match self {
            Cleanup::Container { name, action } => cleanup_container(name, *action),
            Cleanup::FixPermissions { image, work_dir } => {
                Ok(programs::fix_permissions(image, work_dir)?)
            }
            Cleanup::RemoveDir(dir) => Ok(fs::remove_dir_all(dir)?),
        }
    }
}

fn cleanup_container(name: &str, action: Defer) -> Result<(), CleanupError> {
    match docker::is_running(name)? {
        None => log::debug!("container {name} no longer exists"),
        Some(running) => match action {
            Defer::Forgo => log::debug!("leaving container {name} to run"),
            Defer::Stop => docker::stop(name)?,
            Defer::Remove => {
                if running {
                    docker::stop(name)?;
                }
                docker::remove(name)?;
            }
        },
    }

    Ok(())
}

#[derive(Debug, Error)]
enum CleanupError {
    #[error("docker")]
    Docker(#[from] docker::Error),
    #[error("fix permissions")]
    FixPermissions(#[from] programs::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn workflow() -> (tempfile::TempDir, Workflow) {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new(Some(dir.path().to_path_buf())).unwrap();
        let workflow = Workflow::mocked("test", &env).unwrap();
        (dir, workflow)
    }

    #[test]
    fn jobs_get_namespaced_scratch() {
        let (_dir, workflow) = workflow();

        let a = workflow.job("align").unwrap();
        let b = workflow.job("align").unwrap();

        assert_ne!(a.id(), b.id());
        assert_ne!(a.scratch_dir(), b.scratch_dir());
        assert!(a.scratch_dir().exists());
        assert!(a.scratch_dir().starts_with(workflow.paths().scratch().host));
        assert!(a.is_mock());
    }

    #[test]
    fn temp_dirs_are_unique() {
        let (_dir, workflow) = workflow();
        let job = workflow.job("stage").unwrap();

        let one = job.temp_dir().unwrap();
        let two = job.temp_dir().unwrap();

        assert_ne!(one, two);
        assert!(one.exists() && two.exists());
        assert!(one.starts_with(job.scratch_dir()));
    }

    #[test]
    fn deferred_cleanups_run_newest_first() {
        let (_dir, workflow) = workflow();
        let job = workflow.job("cleanup").unwrap();

        job.defer(Cleanup::RemoveDir("/first".into()));
        job.defer(Cleanup::Container {
            name: "c".into(),
            action: Defer::Stop,
        });

        let drained = job.drain_deferred();
        assert!(matches!(drained[0], Cleanup::Container { .. }));
        assert!(matches!(drained[1], Cleanup::RemoveDir(_)));
    }

    #[test]
    fn drop_removes_scratch_and_runs_cleanups() {
        let (_dir, workflow) = workflow();
        let job = workflow.job("drop").unwrap();

        let scratch = job.scratch_dir().to_path_buf();
        let stray = job.temp_dir().unwrap();
        let outside = workflow.paths().downloads().host.join("stray");
        fs::create_dir_all(&outside).unwrap();
        job.defer(Cleanup::RemoveDir(outside.clone()));

        drop(job);

        assert!(!scratch.exists());
        assert!(!stray.exists());
        assert!(!outside.exists());
    }

    #[test]
    fn default_resources_track_the_machine() {
        let resources = Resources::default();

        assert!(resources.cores.get() >= 1);
        assert_eq!(
            Resources {
                memory: 4 * 1024 * 1024 * 1024,
                ..resources
            }
            .xmx(),
            "-Xmx4294967296"
        );
    }

    #[test]
    fn workflow_cleanup_removes_trees() {
        let (_dir, workflow) = workflow();

        let scratch = workflow.paths().scratch().host.clone();
        let store_dir = workflow.paths().store().host.clone();
        let downloads = workflow.paths().downloads().host.clone();
        workflow.cleanup().unwrap();

        assert!(!scratch.exists());
        assert!(!store_dir.exists());
        assert!(downloads.exists());
    }
}
