// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Containerised tool invocation
//!
//! [`DockerCall`] is the one way tool wrappers run containers. It owns
//! the `/data` work dir convention, input and output checking, the
//! mock mode switch and deferred container lifecycle handling.

use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::job::{Cleanup, Job};
use crate::urls;

/// Environment toggle for mock mode
pub const MOCK_MODE_VAR: &str = "TOIL_LIB_MOCK_MODE";

/// Whether mock mode is switched on in the environment
pub fn mock_mode() -> bool {
    std::env::var(MOCK_MODE_VAR)
        .map(|value| is_enabled(&value))
        .unwrap_or(false)
}

fn is_enabled(value: &str) -> bool {
    let value = value.trim();
    value
        .parse::<i64>()
        .map(|n| n != 0)
        .unwrap_or(!value.is_empty())
}

/// What happens to a container whose job drops
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Defer {
    /// Leave it alone
    Forgo,
    /// `docker stop`
    Stop,
    /// `docker stop` then `docker rm`
    Remove,
}

/// An output a container must produce, optionally backed by a url
/// that supplies realistic contents in mock mode
#[derive(Debug, Clone)]
pub struct Output {
    name: String,
    mock_url: Option<Url>,
}

impl Output {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            mock_url: None,
        }
    }

    pub fn mocked_by(mut self, url: Url) -> Self {
        self.mock_url = Some(url);
        self
    }
}

impl From<&str> for Output {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Output {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// One containerised tool invocation under construction
pub struct DockerCall<'a> {
    job: &'a Job,
    image: String,
    work_dir: PathBuf,
    parameters: Vec<String>,
    env: Vec<(String, String)>,
    mounts: Vec<(PathBuf, PathBuf)>,
    inputs: Vec<String>,
    outputs: Vec<Output>,
    docker_args: Vec<String>,
    entrypoint: Option<String>,
    rm: bool,
    detach: bool,
    defer: Option<Defer>,
    name: Option<String>,
    mock: Option<bool>,
}

enum StdoutMode<'p> {
    Inherit,
    Capture,
    File(&'p Path),
}

impl<'a> DockerCall<'a> {
    pub fn new(job: &'a Job, image: impl ToString, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            job,
            image: image.to_string(),
            work_dir: work_dir.into(),
            parameters: vec![],
            env: vec![],
            mounts: vec![],
            inputs: vec![],
            outputs: vec![],
            docker_args: vec![],
            entrypoint: None,
            rm: true,
            detach: false,
            defer: None,
            name: None,
            mock: None,
        }
    }

    /// Arguments for the image's entrypoint
    pub fn parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.parameters
            .extend(parameters.into_iter().map(|p| p.to_string()));
        self
    }

    pub fn env(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Bind mounts beyond the work dir at the guest root
    pub fn mount(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        self.mounts.push((host.into(), guest.into()));
        self
    }

    /// File names that must already sit in the work dir
    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.inputs.extend(inputs.into_iter().map(|i| i.to_string()));
        self
    }

    /// Files the container is expected to produce. Relative names
    /// resolve against the work dir. In mock mode they are fabricated
    /// instead of computed.
    pub fn outputs<I, O>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<Output>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Raw `docker run` flags this builder doesn't model
    pub fn docker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.docker_args
            .extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn entrypoint(mut self, entrypoint: impl ToString) -> Self {
        self.entrypoint = Some(entrypoint.to_string());
        self
    }

    pub fn rm(mut self, rm: bool) -> Self {
        self.rm = rm;
        self
    }

    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn defer(mut self, action: Defer) -> Self {
        self.defer = Some(action);
        self
    }

    pub fn name(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Force mock mode on or off, overriding the job's setting
    pub fn mock(mut self, mock: bool) -> Self {
        self.mock = Some(mock);
        self
    }

    /// Run to completion with inherited stdio
    pub fn run(self) -> Result<(), Error> {
        self.execute(StdoutMode::Inherit).map(drop)
    }

    /// Run to completion, capturing stdout
    pub fn capture_stdout(self) -> Result<String, Error> {
        Ok(self.execute(StdoutMode::Capture)?.unwrap_or_default())
    }

    /// Run to completion with stdout redirected to `path`
    pub fn stdout_to_file(self, path: &Path) -> Result<(), Error> {
        self.execute(StdoutMode::File(path)).map(drop)
    }

    fn execute(self, stdout: StdoutMode<'_>) -> Result<Option<String>, Error> {
        // Docker rejects --rm for detached containers
        if self.rm && self.detach {
            return Err(Error::RmWithDetach);
        }

        for input in &self.inputs {
            let path = self.work_dir.join(input);
            if !path.is_file() {
                return Err(Error::MissingInput(path));
            }
        }

        if self.mock.unwrap_or_else(|| self.job.is_mock()) {
            return self.mock_run(stdout);
        }

        let name = self
            .name
            .clone()
            .unwrap_or_else(|| self.container_name());

        // The permission fix must run after the container kill, and
        // deferred cleanups run newest first
        self.job.defer(Cleanup::FixPermissions {
            image: self.image.clone(),
            work_dir: self.work_dir.clone(),
        });
        if let Some(action) = self.resolved_defer() {
            self.job.defer(Cleanup::Container {
                name: name.clone(),
                action,
            });
        }

        let mut run = docker::Run::new(&self.image)
            .log_driver("none")
            .bind(&self.work_dir, self.job.guest_root());
        for (host, guest) in &self.mounts {
            run = run.bind(host, guest);
        }
        for (key, value) in &self.env {
            run = run.env(key, value);
        }
        run = run
            .docker_args(self.docker_args.iter())
            .name(&name)
            .rm(self.rm)
            .detach(self.detach)
            .command(self.parameters.iter());
        if let Some(entrypoint) = &self.entrypoint {
            run = run.entrypoint(entrypoint);
        }

        let captured = match stdout {
            StdoutMode::Inherit => {
                run.run()?;
                None
            }
            StdoutMode::Capture => Some(run.output()?),
            StdoutMode::File(path) => {
                run.stdout_to_file(&self.resolve(path))?;
                None
            }
        };

        // Container writes arrive owned by root
        fix_permissions(&self.image, &self.work_dir)?;

        for output in &self.outputs {
            let path = self.resolve(Path::new(&output.name));
            if !path.exists() {
                return Err(Error::MissingOutput(path));
            }
        }

        Ok(captured)
    }

    fn mock_run(&self, stdout: StdoutMode<'_>) -> Result<Option<String>, Error> {
        log::debug!("mock run of {}", self.image);

        for output in &self.outputs {
            let path = self.resolve(Path::new(&output.name));
            if path.exists() {
                continue;
            }

            match &output.mock_url {
                Some(url) => {
                    urls::download_url(self.job, url, &self.work_dir, Some(&output.name))?;
                }
                None => fs::write(&path, "contents")?,
            }

            if !path.exists() {
                return Err(Error::MissingOutput(path));
            }
        }

        match stdout {
            StdoutMode::Inherit => Ok(None),
            StdoutMode::Capture => Ok(Some(String::new())),
            StdoutMode::File(path) => {
                let path = self.resolve(path);
                if !path.exists() {
                    fs::write(&path, "")?;
                }
                Ok(None)
            }
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    fn resolved_defer(&self) -> Option<Defer> {
        match self.defer {
            Some(action) => Some(action),
            None if self.rm => Some(Defer::Remove),
            None => None,
        }
    }

    fn container_name(&self) -> String {
        format!(
            "{}--{}--{}",
            self.job.workflow_id(),
            self.job.id(),
            Uuid::new_v4().simple()
        )
    }
}

/// Chown `work_dir` back to its owner through the tool's own image,
/// since files written from the container belong to root
pub(crate) fn fix_permissions(image: &str, work_dir: &Path) -> Result<(), Error> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::metadata(work_dir)?;
    let owner = format!("{}:{}", meta.uid(), meta.gid());

    docker::Run::new(image)
        .log_driver("none")
        .bind(work_dir, "/data")
        .entrypoint("chown")
        .rm(true)
        .command(vec!["-R", owner.as_str(), "/data"])
        .run()?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("conflicting options `rm` and `detach`")]
    RmWithDetach,
    #[error("missing input {0}")]
    MissingInput(PathBuf),
    #[error("output file path not found {0}")]
    MissingOutput(PathBuf),
    #[error("docker")]
    Docker(#[from] docker::Error),
    #[error("mock download")]
    Download(#[source] Box<urls::Error>),
    #[error("io")]
    Io(#[from] io::Error),
}

impl From<urls::Error> for Error {
    fn from(error: urls::Error) -> Self {
        Self::Download(Box::new(error))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;

    fn mock_job() -> (tempfile::TempDir, Workflow) {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new(Some(dir.path().to_path_buf())).unwrap();
        let workflow = Workflow::mocked("programs", &env).unwrap();
        (dir, workflow)
    }

    #[test]
    fn env_toggle_parsing() {
        assert!(is_enabled("1"));
        assert!(is_enabled("2"));
        assert!(is_enabled(" 1 "));
        assert!(is_enabled("true"));
        assert!(!is_enabled("0"));
        assert!(!is_enabled(""));
    }

    #[test]
    fn rm_conflicts_with_detach() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("conflict").unwrap();
        let work_dir = job.temp_dir().unwrap();

        let err = DockerCall::new(&job, "quay.io/ucsc_cgl/samtools", &work_dir)
            .detach(true)
            .run()
            .unwrap_err();

        assert!(matches!(err, Error::RmWithDetach));
    }

    #[test]
    fn inputs_must_be_staged() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("inputs").unwrap();
        let work_dir = job.temp_dir().unwrap();

        let err = DockerCall::new(&job, "quay.io/ucsc_cgl/samtools", &work_dir)
            .inputs(["absent.bam"])
            .run()
            .unwrap_err();

        assert!(matches!(err, Error::MissingInput(_)));
    }

    #[test]
    fn mock_runs_fabricate_outputs() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("fabricate").unwrap();
        let work_dir = job.temp_dir().unwrap();

        DockerCall::new(&job, "quay.io/ucsc_cgl/samtools", &work_dir)
            .parameters(["faidx", "/data/ref.fa"])
            .outputs(["ref.fa.fai"])
            .run()
            .unwrap();

        assert_eq!(fs::read(work_dir.join("ref.fa.fai")).unwrap(), b"contents");
    }

    #[test]
    fn mock_capture_is_empty() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("capture").unwrap();
        let work_dir = job.temp_dir().unwrap();

        let captured = DockerCall::new(&job, "quay.io/ucsc_cgl/samtools", &work_dir)
            .parameters(["view", "-f66", "/data/sample.bam"])
            .capture_stdout()
            .unwrap();

        assert!(captured.is_empty());
    }

    #[test]
    fn mock_stdout_file_is_touched() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("outfile").unwrap();
        let work_dir = job.temp_dir().unwrap();

        DockerCall::new(&job, "quay.io/ucsc_cgl/freebayes", &work_dir)
            .outputs(["aux.txt"])
            .stdout_to_file(Path::new("sample.vcf"))
            .unwrap();

        assert!(work_dir.join("sample.vcf").exists());
        assert!(work_dir.join("aux.txt").exists());
    }

    #[test]
    fn existing_mock_outputs_are_kept() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("keep").unwrap();
        let work_dir = job.temp_dir().unwrap();
        fs::write(work_dir.join("out.bam"), b"real data").unwrap();

        DockerCall::new(&job, "quay.io/ucsc_cgl/bwa", &work_dir)
            .outputs(["out.bam"])
            .run()
            .unwrap();

        assert_eq!(fs::read(work_dir.join("out.bam")).unwrap(), b"real data");
    }

    #[test]
    fn container_names_carry_workflow_and_job() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("name").unwrap();
        let work_dir = job.temp_dir().unwrap();

        let call = DockerCall::new(&job, "quay.io/ucsc_cgl/samtools", &work_dir);
        let name = call.container_name();

        let mut parts = name.split("--");
        assert_eq!(parts.next().unwrap(), workflow.id().as_str());
        assert_eq!(parts.next().unwrap(), job.id().as_str());
        assert!(!parts.next().unwrap().is_empty());
        assert!(parts.next().is_none());
    }

    #[test]
    fn defer_defaults_follow_rm() {
        let (_dir, workflow) = mock_job();
        let job = workflow.job("defer").unwrap();
        let work_dir = job.temp_dir().unwrap();

        let rm = DockerCall::new(&job, "img", &work_dir);
        assert_eq!(rm.resolved_defer(), Some(Defer::Remove));

        let detached = DockerCall::new(&job, "img", &work_dir).rm(false).detach(true);
        assert_eq!(detached.resolved_defer(), None);

        let forgone = DockerCall::new(&job, "img", &work_dir).defer(Defer::Forgo);
        assert_eq!(forgone.resolved_defer(), Some(Defer::Forgo));
    }

    #[test]
    fn defer_policy_names() {
        assert_eq!(Defer::Forgo.to_string(), "forgo");
        assert_eq!(Defer::Remove.to_string(), "remove");
    }
}
