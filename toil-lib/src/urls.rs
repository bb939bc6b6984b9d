// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Moving files in and out of workflows by url
//!
//! `file://` and `http(s)://` urls stream through a shared client into
//! a content keyed download cache and get hardlinked into work dirs.
//! `s3://` urls go through an s3am container, `gnos://` urls through
//! GeneTorrent.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use bytes::Bytes;
use fs_err as fs;
use futures_util::{stream, stream::BoxStream, Stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::job::Job;
use crate::programs::{self, DockerCall};
use crate::store::{self, FileId};
use crate::{environment, runtime, util};

pub const S3AM_IMAGE: &str = "quay.io/ucsc_cgl/s3am:2.0--fed932897e7fd40f4ec878362e5dd6afe15caaf0";
pub const GENETORRENT_IMAGE: &str =
    "quay.io/ucsc_cgl/genetorrent:3.8.7--9911761265b6f08bc3ef09f53af05f56848d805b";

/// One url transfer under construction
#[derive(Debug, Clone)]
pub struct Transfer {
    url: Url,
    name: Option<String>,
    s3_key: Option<PathBuf>,
    gnos_key: Option<PathBuf>,
    sha256: Option<String>,
}

impl Transfer {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            name: None,
            s3_key: None,
            gnos_key: None,
            sha256: None,
        }
    }

    /// Local file name, defaults to the last url path segment
    pub fn named(mut self, name: impl ToString) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Master key for sse-c encrypted s3 objects
    pub fn s3_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.s3_key = Some(key.into());
        self
    }

    /// GeneTorrent credential, switches the transfer to gnos handling
    pub fn gnos_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.gnos_key = Some(key.into());
        self
    }

    /// Expected sha256 of the downloaded payload
    pub fn sha256(mut self, digest: impl ToString) -> Self {
        self.sha256 = Some(digest.to_string());
        self
    }

    /// Materialise the url in `work_dir`, returning the local path.
    /// For gnos transfers this is the analysis directory.
    pub fn download(&self, job: &Job, work_dir: &Path) -> Result<PathBuf, Error> {
        util::ensure_dir_exists(work_dir)?;

        if let Some(key) = &self.gnos_key {
            return download_with_genetorrent(job, &self.url, work_dir, key);
        }

        let dest = work_dir.join(self.file_name()?);
        match self.url.scheme() {
            "s3" => s3am(job, &dest, self.url.as_str(), Direction::Download, self.s3_key.as_deref())?,
            _ => fetch_cached(job, &self.url, &dest, self.sha256.as_deref())?,
        }

        if !dest.exists() {
            return Err(Error::MissingDownload(dest));
        }
        Ok(dest)
    }

    /// Download straight into the workflow's file store
    pub fn download_to_store(&self, job: &Job) -> Result<FileId, Error> {
        let work_dir = job.temp_dir()?;
        let path = self.download(job, &work_dir)?;
        Ok(job.write_file(&path)?)
    }

    fn file_name(&self) -> Result<String, Error> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => util::uri_file_name(&self.url).to_owned(),
        };
        if name.is_empty() {
            return Err(Error::NoFileName(self.url.to_string()));
        }
        Ok(name)
    }
}

/// Materialise `url` in `work_dir`, optionally renamed
pub fn download_url(job: &Job, url: &Url, work_dir: &Path, name: Option<&str>) -> Result<PathBuf, Error> {
    let mut transfer = Transfer::new(url.clone());
    if let Some(name) = name {
        transfer = transfer.named(name);
    }
    transfer.download(job, work_dir)
}

/// Download `url` straight into the workflow's file store
pub fn download_to_store(job: &Job, url: &Url) -> Result<FileId, Error> {
    Transfer::new(url.clone()).download_to_store(job)
}

/// Stage several transfers into `work_dir`, plain urls concurrently,
/// containerised transfers one at a time. Paths come back in input
/// order.
pub fn fetch_all(job: &Job, transfers: Vec<Transfer>, work_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    util::ensure_dir_exists(work_dir)?;

    let mut results: Vec<Option<PathBuf>> = vec![None; transfers.len()];
    let mut plain = vec![];

    for (index, transfer) in transfers.into_iter().enumerate() {
        if transfer.gnos_key.is_some() || transfer.url.scheme() == "s3" {
            results[index] = Some(transfer.download(job, work_dir)?);
        } else {
            let dest = work_dir.join(transfer.file_name()?);
            plain.push((index, transfer, dest));
        }
    }

    let downloads = job.downloads_dir();
    let fetched = runtime::block_on(async {
        stream::iter(plain.into_iter().map(|(index, transfer, dest)| async move {
            fetch_cached_async(downloads, &transfer.url, &dest, transfer.sha256.as_deref()).await?;
            Ok::<_, Error>((index, dest))
        }))
        .buffer_unordered(environment::MAX_NETWORK_CONCURRENCY)
        .try_collect::<Vec<(usize, PathBuf)>>()
        .await
    })?;

    for (index, path) in fetched {
        results[index] = Some(path);
    }

    Ok(results.into_iter().flatten().collect())
}

/// Upload `path` into the `s3://` directory url `s3_dir`, keeping
/// its file name
pub fn s3am_upload(job: &Job, path: &Path, s3_dir: &Url, s3_key: Option<&Path>) -> Result<(), Error> {
    if s3_dir.scheme() != "s3" {
        return Err(Error::NotS3(s3_dir.clone()));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::NoFileName(path.display().to_string()))?;
    let s3_url = format!("{}/{}", s3_dir.as_str().trim_end_matches('/'), file_name);

    s3am(job, path, &s3_url, Direction::Upload, s3_key)
}

/// Upload a stored file under `name` into the `s3://` directory url
pub fn s3am_upload_from_store(
    job: &Job,
    id: &FileId,
    name: &str,
    s3_dir: &Url,
    s3_key: Option<&Path>,
) -> Result<(), Error> {
    let work_dir = job.temp_dir()?;
    let path = work_dir.join(name);
    job.read_file(id, &path)?;
    s3am_upload(job, &path, s3_dir, s3_key)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

/// Drive s3am through its container. The file's directory is mirrored
/// under `/data` so container paths line up with host paths.
fn s3am(job: &Job, file_path: &Path, s3_url: &str, direction: Direction, s3_key: Option<&Path>) -> Result<(), Error> {
    let cores = job.resources.cores;
    let dir = file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| Error::NoFileName(file_path.display().to_string()))?;
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::NoFileName(file_path.display().to_string()))?;

    let guest_dir = format!("/data{}", dir.display());
    let file_url = format!("file://{guest_dir}/{file_name}");

    let mut arguments: Vec<String> = match direction {
        Direction::Upload => vec![
            "upload".into(),
            "--force".into(),
            format!("--upload-slots={cores}"),
            "--exists=overwrite".into(),
        ],
        Direction::Download => vec![
            "download".into(),
            "--file-exists=overwrite".into(),
            "--download-exists=discard".into(),
        ],
    };

    if let Some(key) = s3_key {
        arguments.push("--sse-key-is-master".into());
        arguments.push("--sse-key-file".into());
        arguments.push(format!("/data{}", key.display()));
    }

    arguments.push("--part-size=50M".into());
    arguments.push(format!("--download-slots={cores}"));

    match direction {
        Direction::Upload => {
            arguments.push(file_url);
            arguments.push(s3_url.to_owned());
        }
        Direction::Download => {
            arguments.push(s3_url.to_owned());
            arguments.push(file_url);
        }
    }

    let build = || {
        let mut call = DockerCall::new(job, S3AM_IMAGE, job.scratch_dir())
            .mount(dir, &guest_dir)
            .parameters(arguments.iter());

        if let Some(key) = s3_key {
            if let Some(key_dir) = key.parent() {
                call = call.mount(key_dir, format!("/data{}", key_dir.display()));
            }
        }
        if let Some(home) = dirs::home_dir() {
            let aws = home.join(".aws/credentials");
            if aws.exists() {
                call = call.mount(aws, "/root/.aws/credentials");
            }
            let boto = home.join(".boto");
            if boto.exists() {
                call = call.mount(boto, "/root/.boto");
            }
        }
        if let Ok(profile) = std::env::var("AWS_PROFILE") {
            call = call.env("AWS_PROFILE", profile);
        }

        call
    };

    let mut attempt = 1;
    loop {
        match build().run() {
            Ok(()) => return Ok(()),
            Err(error) if attempt < environment::S3AM_ATTEMPTS => {
                log::warn!(
                    "s3am transfer of {s3_url} failed, retrying ({attempt}/{}): {error}",
                    environment::S3AM_ATTEMPTS
                );
                attempt += 1;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

/// Fetch a GeneTorrent analysis into `work_dir`, returning the
/// analysis directory. Exactly one tarball must arrive.
fn download_with_genetorrent(job: &Job, url: &Url, work_dir: &Path, key: &Path) -> Result<PathBuf, Error> {
    if url.scheme() != "gnos" {
        return Err(Error::NotGnos(url.clone()));
    }
    let analysis_id = url.path().trim_start_matches('/').to_owned();
    if analysis_id.is_empty() {
        return Err(Error::NotGnos(url.clone()));
    }

    // GeneTorrent resolves the credential inside the container
    let key_name = key
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::NoFileName(key.display().to_string()))?;
    let staged_key = work_dir.join(&key_name);
    if !staged_key.exists() {
        fs::copy(key, &staged_key)?;
    }

    let guest_key = format!("/data/{key_name}");
    DockerCall::new(job, GENETORRENT_IMAGE, work_dir)
        .parameters(["-vv", "-c", guest_key.as_str(), "-d", analysis_id.as_str()])
        .run()?;

    let analysis_dir = work_dir.join(&analysis_id);
    let pattern = glob::Pattern::new("*tar*")?;
    let tarballs = util::enumerate_files(&analysis_dir, |path| {
        path.file_name()
            .map(|n| pattern.matches(&n.to_string_lossy()))
            .unwrap_or(false)
    })?;

    if tarballs.len() != 1 {
        return Err(Error::GenetorrentOutput {
            analysis_id,
            found: tarballs.len(),
        });
    }

    Ok(analysis_dir)
}

fn fetch_cached(job: &Job, url: &Url, dest: &Path, expected: Option<&str>) -> Result<(), Error> {
    runtime::block_on(fetch_cached_async(job.downloads_dir(), url, dest, expected))
}

/// Download through the shared cache, then hardlink into place
async fn fetch_cached_async(downloads: &Path, url: &Url, dest: &Path, expected: Option<&str>) -> Result<(), Error> {
    let cached = cache_path(downloads, url, expected);

    if !cached.exists() {
        if let Some(parent) = cached.parent() {
            fs::tokio::create_dir_all(parent).await?;
        }
        fetch(url, &cached, expected).await?;
    }

    if dest.exists() {
        fs::remove_file(dest)?;
    }
    util::hardlink_or_copy(&cached, dest)?;

    Ok(())
}

/// Cache objects are keyed by url and expected digest
fn cache_path(downloads: &Path, url: &Url, expected: Option<&str>) -> PathBuf {
    let hash = hex::encode(Sha256::digest(format!(
        "{url}{}",
        expected.unwrap_or_default()
    )));

    downloads
        .join(&hash[..5])
        .join(&hash[hash.len() - 5..])
        .join(hash)
}

async fn fetch(url: &Url, dest: &Path, expected: Option<&str>) -> Result<(), Error> {
    let mut attempt = 1;
    loop {
        match try_fetch(url, dest, expected).await {
            // Wrong bytes won't improve on a second read
            Err(error @ Error::Sha256Mismatch { .. }) => return Err(error),
            Err(error) if attempt < environment::FETCH_ATTEMPTS => {
                log::warn!(
                    "fetch of {url} failed, retrying ({attempt}/{}): {error}",
                    environment::FETCH_ATTEMPTS
                );
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn try_fetch(url: &Url, dest: &Path, expected: Option<&str>) -> Result<(), Error> {
    let mut stream = payload_stream(url.clone()).await?;

    // Stage under a partial name so a failed transfer never
    // occupies the final cache address
    let partial = dest.with_extension("part");
    let mut hasher = Sha256::new();
    let mut file = fs::tokio::File::create(&partial).await?;

    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        hasher.update(&bytes);
        file.write_all(&bytes).await?;
    }
    file.flush().await?;
    drop(file);

    if let Some(expected) = expected {
        let got = hex::encode(hasher.finalize());
        if got != expected.to_lowercase() {
            fs::tokio::remove_file(&partial).await?;
            return Err(Error::Sha256Mismatch {
                name: util::uri_file_name(url).to_owned(),
                expected: expected.to_owned(),
                got,
            });
        }
    }

    fs::tokio::rename(&partial, dest).await?;

    Ok(())
}

/// Shared client for tcp socket reuse and connection limit
fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

    CLIENT.get_or_init(|| {
        reqwest::ClientBuilder::new()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .expect("build reqwest client")
    })
}

/// Response bytes of `url`, whether local or remote
async fn payload_stream(url: Url) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
    match url_file(&url) {
        Some(path) => Ok(read(path).await?.boxed()),
        _ => Ok(http(url).await?.boxed()),
    }
}

async fn http(url: Url) -> Result<impl Stream<Item = Result<Bytes, Error>>, Error> {
    let response = client().get(url).send().await?;

    response
        .error_for_status()
        .map(reqwest::Response::bytes_stream)
        .map(|stream| stream.map(|result| result.map_err(Error::Fetch)))
        .map_err(Error::Fetch)
}

async fn read(path: PathBuf) -> Result<impl Stream<Item = Result<Bytes, Error>>, Error> {
    // 4 MiB
    const BUFFER_SIZE: usize = 4 * 1024 * 1024;

    let file = fs::tokio::File::open(path).await?;

    Ok(tokio_util::io::ReaderStream::with_capacity(file, BUFFER_SIZE).map(|result| result.map_err(Error::Io)))
}

fn url_file(url: &Url) -> Option<PathBuf> {
    if url.scheme() == "file" {
        url.to_file_path().ok()
    } else {
        None
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch error: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("sha256 mismatch for {name}, expected {expected}, got {got}")]
    Sha256Mismatch {
        name: String,
        expected: String,
        got: String,
    },
    #[error("expected an s3:// url, got {0}")]
    NotS3(Url),
    #[error("expected a gnos:// url, got {0}")]
    NotGnos(Url),
    #[error("cannot derive a file name from {0}")]
    NoFileName(String),
    #[error("download missing at {0}")]
    MissingDownload(PathBuf),
    #[error("expected exactly one tarball for analysis {analysis_id}, found {found}")]
    GenetorrentOutput { analysis_id: String, found: usize },
    #[error("glob pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("docker call")]
    DockerCall(#[from] programs::Error),
    #[error("store")]
    Store(#[from] store::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
