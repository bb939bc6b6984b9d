// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Harness for shipping a pipeline as a docker image
//!
//! The image's entrypoint wraps the real pipeline command. The cli is
//! populated at runtime from the pipeline's own generated YAML config,
//! nested keys flattened into dotted `--options`, so the image needs no
//! per-release hand written argument list. Must run inside a container
//! with the daemon socket and one mirror mount for the work directory.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use clap::{Arg, ArgAction, ArgMatches};
use fs_err as fs;
use itertools::Itertools;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::util;

/// Pipeline specific extension points
pub trait Pipeline {
    /// Command name of the pipeline, also the config file stem
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Additional cli arguments beyond the standard and config driven ones
    fn extend_command(&self, command: clap::Command) -> clap::Command {
        command
    }

    /// Additional arguments for the assembled pipeline invocation
    fn extend_invocation(
        &self,
        _invocation: &mut Vec<String>,
        _matches: &ArgMatches,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Runs a [`Pipeline`] inside its shipping container
pub struct PipelineWrapper<P: Pipeline> {
    pipeline: P,
}

impl<P: Pipeline> PipelineWrapper<P> {
    pub fn new(pipeline: P) -> Self {
        Self { pipeline }
    }

    /// Entry point for the image's wrapper binary
    pub fn run(self) -> Result<(), Error> {
        self.run_from(std::env::args())
    }

    pub fn run_from<I, T>(self, args: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mount = work_mount()?;
        let name = self.pipeline.name().to_owned();

        let mut config = self.generate_config()?;
        let mut options = vec![];
        flatten(&config, "", &mut options);

        let command = self
            .pipeline
            .extend_command(standard_command(&name, self.pipeline.description()));
        let matches = config_command(command, &options).try_get_matches_from(args)?;

        for (key, _) in &options {
            if let Some(value) = matches.get_one::<String>(key) {
                let parts = key.split('.').collect::<Vec<_>>();
                set_nested(&mut config, &parts, parse_scalar(value));
            }
        }

        let config_path = std::env::current_dir()?.join(format!("config-{name}.yaml"));
        fs::write(&config_path, serde_yaml::to_string(&Value::Mapping(config))?)?;

        let restart = matches.get_flag("restart");
        let workdir = prepare_workdir(&mount, &name, restart)?;

        let mut invocation = pipeline_invocation(&name, &workdir, &config_path, restart);
        self.pipeline.extend_invocation(&mut invocation, &matches)?;

        let result = invoke(&invocation);
        let cleanup = finalize(&mount, &workdir, matches.get_flag("no-clean"));

        match (result, cleanup) {
            (Err(error), Err(cleanup)) => {
                log::warn!("cleanup failed: {cleanup}");
                Err(error)
            }
            (Err(error), Ok(())) => Err(error),
            (Ok(()), cleanup) => cleanup,
        }
    }

    /// Run `<name> generate-config` and slurp the file it drops in the
    /// working directory
    fn generate_config(&self) -> Result<Mapping, Error> {
        let name = self.pipeline.name();

        let status = Command::new(name).arg("generate-config").status()?;
        if !status.success() {
            return Err(Error::CommandFailed {
                command: format!("{name} generate-config"),
                status,
            });
        }

        let path = std::env::current_dir()?.join(format!("config-{name}.yaml"));
        let contents = fs::read_to_string(&path)?;
        fs::remove_file(&path)?;

        Ok(serde_yaml::from_str(&contents)?)
    }
}

fn standard_command(name: &str, description: &str) -> clap::Command {
    clap::Command::new(name.to_owned())
        .about(description.to_owned())
        .arg(
            Arg::new("no-clean")
                .long("no-clean")
                .action(ArgAction::SetTrue)
                .help("Keep the temporary work directory"),
        )
        .arg(
            Arg::new("restart")
                .long("restart")
                .action(ArgAction::SetTrue)
                .help("Resume a previously uncleaned workflow in the same directory"),
        )
        .arg(
            Arg::new("cores")
                .long("cores")
                .value_parser(clap::value_parser!(usize))
                .help("Cap on the number of cores to use, defaults to all available"),
        )
}

/// One `--key` per flattened config key, YAML value as the default
fn config_command(mut command: clap::Command, options: &[(String, Option<Value>)]) -> clap::Command {
    for (key, default) in options {
        // Reserved by the standard options and clap's built-ins
        if matches!(key.as_str(), "no-clean" | "restart" | "cores" | "help" | "version") {
            log::warn!("config key {key} shadows a standard option, skipping");
            continue;
        }

        let mut arg = Arg::new(key.clone())
            .long(key.clone())
            .value_name("VALUE")
            .action(ArgAction::Set);
        if let Some(default) = default {
            arg = arg.help(format!("[default: {}]", render_scalar(default)));
        }
        command = command.arg(arg);
    }

    command
}

/// Dotted keys for every leaf of the config, depth first in document
/// order. Empty sub-mappings contribute nothing.
fn flatten(mapping: &Mapping, prefix: &str, options: &mut Vec<(String, Option<Value>)>) {
    for (key, value) in mapping {
        let Value::String(name) = key else {
            continue;
        };
        let dotted = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };

        match value {
            Value::Mapping(nested) => flatten(nested, &dotted, options),
            Value::Null => options.push((dotted, None)),
            other => options.push((dotted, Some(other.clone()))),
        }
    }
}

fn set_nested(mapping: &mut Mapping, path: &[&str], value: Value) {
    let [head, rest @ ..] = path else {
        return;
    };
    let key = Value::String((*head).to_owned());

    if rest.is_empty() {
        mapping.insert(key, value);
    } else if let Some(Value::Mapping(nested)) = mapping.get_mut(&key) {
        set_nested(nested, rest, value);
    }
}

/// Overrides arrive as strings, YAML scalar parsing keeps numbers
/// and booleans typed in the written config
fn parse_scalar(raw: &str) -> Value {
    serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_owned(),
    }
}

/// The mirror mount the pipeline works under. Requires the daemon
/// socket mounted and exactly one mirror mount beside it.
fn work_mount() -> Result<PathBuf, Error> {
    if !docker::running_in_container() {
        return Err(Error::NotInContainer);
    }
    if !docker::daemon_reachable() {
        return Err(Error::DaemonUnreachable);
    }

    let id = docker::current_container_id()?;
    let mount = work_mount_from(&docker::mounts(&id)?)?;
    log::info!("the work mount is {}", mount.display());

    Ok(mount)
}

fn work_mount_from(mounts: &[docker::Mount]) -> Result<PathBuf, Error> {
    let is_sock = |mount: &docker::Mount| mount.source.to_string_lossy().contains("docker.sock");

    if mounts.iter().filter(|m| is_sock(m)).count() != 1 {
        return Err(Error::SocketMount);
    }

    if mounts.len() == 2 {
        if !mounts.iter().all(|m| m.source == m.destination) {
            return Err(Error::MirrorMount);
        }
        return mounts
            .iter()
            .find(|m| !is_sock(m))
            .map(|m| m.source.clone())
            .ok_or(Error::WorkMount(0));
    }

    let work = mounts
        .iter()
        .filter(|m| m.source == m.destination && !is_sock(m))
        .collect::<Vec<_>>();
    if work.len() != 1 {
        return Err(Error::WorkMount(work.len()));
    }

    Ok(work[0].source.clone())
}

/// `Toil-<name>` under the work mount. Reuse requires `--restart`.
fn prepare_workdir(mount: &Path, name: &str, restart: bool) -> Result<PathBuf, Error> {
    let workdir = mount.join(format!("Toil-{name}"));

    if workdir.exists() {
        if !restart {
            return Err(Error::WorkdirExists(workdir));
        }
        log::info!("reusing work directory {}", workdir.display());
    } else {
        util::ensure_dir_exists(&workdir)?;
        log::info!("created work directory {}", workdir.display());
    }

    Ok(workdir)
}

fn pipeline_invocation(name: &str, workdir: &Path, config_path: &Path, restart: bool) -> Vec<String> {
    let mut invocation = vec![
        name.to_owned(),
        "run".to_owned(),
        workdir.join("jobStore").display().to_string(),
        "--config".to_owned(),
        config_path.display().to_string(),
        "--workDir".to_owned(),
        workdir.display().to_string(),
        "--retryCount".to_owned(),
        "1".to_owned(),
    ];
    if restart {
        invocation.push("--restart".to_owned());
    }

    invocation
}

fn invoke(invocation: &[String]) -> Result<(), Error> {
    log::info!("running {}", invocation.iter().join(" "));

    let status = Command::new(&invocation[0]).args(&invocation[1..]).status()?;
    if !status.success() {
        return Err(Error::PipelineFailed(status));
    }

    Ok(())
}

/// Runs whether the pipeline succeeded or not. Container writes under
/// the mount belong to root until the chown.
fn finalize(mount: &Path, workdir: &Path, no_clean: bool) -> Result<(), Error> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::metadata(mount)?;
    let owner = format!("{}:{}", meta.uid(), meta.gid());
    log::info!(
        "pipeline terminated, changing ownership of {} back to {owner}",
        mount.display()
    );

    let status = Command::new("chown")
        .arg("-R")
        .arg(&owner)
        .arg(mount)
        .status()?;
    if !status.success() {
        return Err(Error::CommandFailed {
            command: format!("chown -R {owner}"),
            status,
        });
    }

    if no_clean {
        log::info!("--no-clean was used, keeping {}", workdir.display());
    } else {
        log::info!("cleaning up work directory {}", workdir.display());
        fs::remove_dir_all(workdir)?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not running inside a container, the wrapper must ship as a docker image")]
    NotInContainer,
    #[error("docker daemon unreachable, run with -v /var/run/docker.sock:/var/run/docker.sock")]
    DaemonUnreachable,
    #[error("expected exactly one docker.sock mount")]
    SocketMount,
    #[error("mount source and destination must match when only one extra mount is given")]
    MirrorMount,
    #[error("expected exactly one mirror work mount, found {0}")]
    WorkMount(usize),
    #[error("work directory {0} already exists, pass --restart or remove it")]
    WorkdirExists(PathBuf),
    #[error("{command} failed with {status}")]
    CommandFailed { command: String, status: ExitStatus },
    #[error("pipeline failed with {0}")]
    PipelineFailed(ExitStatus),
    #[error("cli")]
    Cli(#[from] clap::Error),
    #[error("config")]
    Config(#[from] serde_yaml::Error),
    #[error("docker")]
    Docker(#[from] docker::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
