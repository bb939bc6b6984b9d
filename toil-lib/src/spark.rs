// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Standalone Spark clusters as detached containers
//!
//! Service containers outlive the tool call that starts them, so they
//! drive the docker layer directly and are torn down through the job's
//! deferred cleanups. The tool-call mock switch does not apply here.

use thiserror::Error;

use crate::job::{Cleanup, Job};
use crate::programs::Defer;

pub const SPARK_MASTER_IMAGE: &str = "quay.io/ucsc_cgl/apache-spark-master:1.5.2";
pub const SPARK_WORKER_IMAGE: &str = "quay.io/ucsc_cgl/apache-spark-worker:1.5.2";
pub const SPARK_MASTER_PORT: u16 = 7077;

/// Local scratch the spark images expect on their host
const EPHEMERAL_DIR: &str = "/mnt/ephemeral/";

/// A running master plus workers, addressed by container name
pub struct SparkCluster {
    master_host: String,
    master: String,
    workers: Vec<String>,
}

impl SparkCluster {
    /// Launch a master and `workers` worker containers on the host
    /// network, sized by the job's resources. Every container gets a
    /// deferred [`Defer::Remove`] on the job.
    pub fn launch(job: &Job, workers: usize) -> Result<Self, Error> {
        let master_host = hostname()?;

        let master = master_name(job);
        docker::Run::new(SPARK_MASTER_IMAGE)
            .docker_args(["--net=host"])
            .bind(EPHEMERAL_DIR, "/ephemeral/")
            .env("SPARK_MASTER_IP", &master_host)
            .env("SPARK_LOCAL_DIRS", "/ephemeral/spark/local")
            .env("SPARK_WORKER_DIR", "/ephemeral/spark/work")
            .name(&master)
            .detach(true)
            .command([&master_host])
            .run()?;
        job.defer(Cleanup::Container {
            name: master.clone(),
            action: Defer::Remove,
        });
        log::info!("started spark master on {master_host}");

        let master_address = format!("{master_host}:{SPARK_MASTER_PORT}");
        let workers = (0..workers)
            .map(|index| {
                let name = worker_name(job, index);
                docker::Run::new(SPARK_WORKER_IMAGE)
                    .docker_args(["--net=host"])
                    .bind(EPHEMERAL_DIR, "/ephemeral/")
                    .env("SPARK_MASTER_IP", &master_address)
                    .env("SPARK_LOCAL_DIRS", "/ephemeral/spark/local")
                    .env("SPARK_WORKER_DIR", "/ephemeral/spark/work")
                    .env("SPARK_WORKER_CORES", job.resources.cores)
                    .name(&name)
                    .detach(true)
                    .command([&master_address])
                    .run()?;
                job.defer(Cleanup::Container {
                    name: name.clone(),
                    action: Defer::Remove,
                });
                Ok(name)
            })
            .collect::<Result<Vec<_>, Error>>()?;
        log::info!("started {} spark workers against {master_address}", workers.len());

        Ok(Self {
            master_host,
            master,
            workers,
        })
    }

    /// Address jobs submit against
    pub fn master_url(&self) -> String {
        format!("spark://{}:{}", self.master_host, SPARK_MASTER_PORT)
    }

    pub fn master_host(&self) -> &str {
        &self.master_host
    }

    /// Whether every cluster container is still up
    pub fn is_running(&self) -> Result<bool, Error> {
        for name in self.workers.iter().chain([&self.master]) {
            if !docker::is_running(name)?.unwrap_or(false) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Tear the cluster down ahead of the deferred cleanup, workers
    /// before the master
    pub fn stop(&self) -> Result<(), Error> {
        for name in self.workers.iter().chain([&self.master]) {
            match docker::is_running(name)? {
                None => log::debug!("spark container {name} no longer exists"),
                Some(running) => {
                    if running {
                        docker::stop(name)?;
                    }
                    docker::remove(name)?;
                }
            }
        }
        Ok(())
    }
}

fn master_name(job: &Job) -> String {
    format!("{}--spark-master", job.id())
}

fn worker_name(job: &Job, index: usize) -> String {
    format!("{}--spark-worker-{index}", job.id())
}

fn hostname() -> Result<String, Error> {
    nix::unistd::gethostname()?
        .into_string()
        .map_err(|_| Error::Hostname)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("hostname is not valid utf8")]
    Hostname,
    #[error("docker")]
    Docker(#[from] docker::Error),
    #[error("system")]
    Sys(#[from] nix::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;

    #[test]
    fn master_urls_use_the_spark_scheme() {
        let cluster = SparkCluster {
            master_host: "node1.cluster".into(),
            master: "m".into(),
            workers: vec![],
        };

        assert_eq!(cluster.master_url(), "spark://node1.cluster:7077");
    }

    #[test]
    fn container_names_are_job_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new(Some(dir.path().to_path_buf())).unwrap();
        let workflow = Workflow::mocked("spark", &env).unwrap();
        let job = workflow.job("adam").unwrap();

        assert!(master_name(&job).starts_with(job.id().as_str()));
        assert_ne!(worker_name(&job, 0), worker_name(&job, 1));
    }
}
