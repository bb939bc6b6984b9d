// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Thin wrapper over the `docker` command line client
//!
//! Everything goes through the client binary rather than the engine API, so
//! this works wherever a worker has `docker` on `PATH`, including inside a
//! container that bind mounts the daemon socket.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{self, ExitStatus, Stdio};
use std::{io, string};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// A `docker run` invocation under construction
#[derive(Debug, Clone, Default)]
pub struct Run {
    image: String,
    command: Vec<String>,
    binds: Vec<(PathBuf, PathBuf)>,
    env: Vec<(String, String)>,
    name: Option<String>,
    rm: bool,
    detach: bool,
    entrypoint: Option<String>,
    log_driver: Option<String>,
    extra_args: Vec<String>,
}

impl Run {
    pub fn new(image: impl ToString) -> Self {
        Self {
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// Arguments passed to the image's entrypoint
    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.command = args.into_iter().map(|arg| arg.to_string()).collect();
        self
    }

    /// Bind mount `host` at `guest`
    pub fn bind(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        self.binds.push((host.into(), guest.into()));
        self
    }

    pub fn env(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn name(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
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

    pub fn entrypoint(mut self, entrypoint: impl ToString) -> Self {
        self.entrypoint = Some(entrypoint.to_string());
        self
    }

    pub fn log_driver(mut self, driver: impl ToString) -> Self {
        self.log_driver = Some(driver.to_string());
        self
    }

    /// Raw arguments spliced in before the image name, for flags
    /// this builder doesn't model (`--net=host`, `--memory`, ..)
    pub fn docker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.extra_args.extend(args.into_iter().map(|arg| arg.to_string()));
        self
    }

    /// The argument vector passed to the `docker` binary
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec!["run".to_owned()];

        if let Some(driver) = &self.log_driver {
            argv.push(format!("--log-driver={driver}"));
        }
        for (host, guest) in &self.binds {
            argv.push("-v".to_owned());
            argv.push(format!("{}:{}", host.display(), guest.display()));
        }
        for (key, value) in &self.env {
            argv.push("-e".to_owned());
            argv.push(format!("{key}={value}"));
        }
        argv.extend(self.extra_args.iter().cloned());
        if let Some(entrypoint) = &self.entrypoint {
            argv.push(format!("--entrypoint={entrypoint}"));
        }
        if let Some(name) = &self.name {
            argv.push("--name".to_owned());
            argv.push(name.clone());
        }
        if self.rm {
            argv.push("--rm".to_owned());
        }
        if self.detach {
            argv.push("-d".to_owned());
        }
        argv.push(self.image.clone());
        argv.extend(self.command.iter().cloned());

        argv
    }

    fn build(&self) -> process::Command {
        let argv = self.argv();

        log::debug!("docker {}", argv.join(" "));

        let mut command = process::Command::new("docker");
        command.args(argv);
        command
    }

    /// Run to completion with inherited stdio, returning the raw exit status
    pub fn status(self) -> Result<ExitStatus, Error> {
        Ok(self.build().status()?)
    }

    /// Run to completion, failing on a non-zero exit
    pub fn run(self) -> Result<(), Error> {
        let status = self.status()?;
        if !status.success() {
            return Err(Error::Failed { command: "run", status });
        }
        Ok(())
    }

    /// Run to completion and capture stdout, stderr stays inherited
    pub fn output(self) -> Result<String, Error> {
        let output = self.build().stderr(Stdio::inherit()).output()?;
        if !output.status.success() {
            return Err(Error::Failed {
                command: "run",
                status: output.status,
            });
        }
        Ok(String::from_utf8(output.stdout)?)
    }

    /// Run to completion with stdout redirected to `path`
    pub fn stdout_to_file(self, path: &Path) -> Result<(), Error> {
        let (file, _) = fs_err::File::create(path)?.into_parts();
        let status = self.build().stdout(file).status()?;
        if !status.success() {
            return Err(Error::Failed { command: "run", status });
        }
        Ok(())
    }
}

/// Queries the running state of a container. `None` means the
/// daemon knows nothing about the name, typically because the
/// container was started with `--rm` and already exited.
pub fn is_running(name: &str) -> Result<Option<bool>, Error> {
    let output = process::Command::new("docker")
        .args(["inspect", "--format", "{{.State.Running}}", name])
        .stderr(Stdio::null())
        .output()?;

    if !output.status.success() {
        return Ok(None);
    }

    parse_running(&String::from_utf8(output.stdout)?).map(Some)
}

fn parse_running(raw: &str) -> Result<bool, Error> {
    match raw.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::UnexpectedState(other.to_owned())),
    }
}

/// `docker stop`
pub fn stop(name: &str) -> Result<(), Error> {
    checked("stop", name)
}

/// `docker rm`
pub fn remove(name: &str) -> Result<(), Error> {
    checked("rm", name)
}

fn checked(subcommand: &'static str, name: &str) -> Result<(), Error> {
    log::debug!("docker {subcommand} {name}");

    let status = process::Command::new("docker")
        .args([subcommand, name])
        .stdout(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(Error::Failed {
            command: subcommand,
            status,
        });
    }
    Ok(())
}

/// Whether the daemon answers `docker info`
pub fn daemon_reachable() -> bool {
    process::Command::new("docker")
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Whether this process itself runs inside a container
pub fn running_in_container() -> bool {
    Path::new("/.dockerenv").exists()
}

/// The id of the container this process runs in, from the
/// cgroup hierarchy of pid 1
pub fn current_container_id() -> Result<String, Error> {
    container_id_from_cgroup(&fs_err::read_to_string("/proc/1/cgroup")?)
}

fn container_id_from_cgroup(raw: &str) -> Result<String, Error> {
    let pattern = Regex::new(r"[0-9a-f]{12,}")?;

    let ids = pattern
        .find_iter(raw)
        .map(|m| m.as_str().to_owned())
        .collect::<BTreeSet<_>>();

    if ids.len() != 1 {
        return Err(Error::AmbiguousContainerId(ids.len()));
    }
    // len checked above
    Ok(ids.into_iter().next().unwrap_or_default())
}

/// A bind mount reported by `docker inspect`
#[derive(Debug, Clone, Deserialize)]
pub struct Mount {
    #[serde(rename = "Source")]
    pub source: PathBuf,
    #[serde(rename = "Destination")]
    pub destination: PathBuf,
}

#[derive(Deserialize)]
struct Inspected {
    #[serde(rename = "Mounts", default)]
    mounts: Vec<Mount>,
}

/// The bind mounts of a container
pub fn mounts(container: &str) -> Result<Vec<Mount>, Error> {
    let output = process::Command::new("docker")
        .args(["inspect", container])
        .stderr(Stdio::inherit())
        .output()?;

    if !output.status.success() {
        return Err(Error::Failed {
            command: "inspect",
            status: output.status,
        });
    }

    mounts_from_inspect(&String::from_utf8(output.stdout)?)
}

fn mounts_from_inspect(raw: &str) -> Result<Vec<Mount>, Error> {
    let inspected = serde_json::from_str::<Vec<Inspected>>(raw)?;

    inspected
        .into_iter()
        .next()
        .map(|i| i.mounts)
        .ok_or(Error::NoSuchContainer)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("docker {command} failed with {status}")]
    Failed {
        command: &'static str,
        status: ExitStatus,
    },
    #[error("unexpected container state {0:?}")]
    UnexpectedState(String),
    #[error("expected exactly one container id in cgroup, found {0}")]
    AmbiguousContainerId(usize),
    #[error("container not found")]
    NoSuchContainer,
    #[error("pattern")]
    Pattern(#[from] regex::Error),
    #[error("inspect output")]
    Inspect(#[from] serde_json::Error),
    #[error("utf8")]
    Utf8(#[from] string::FromUtf8Error),
    #[error("io")]
    Io(#[from] io::Error),
}
