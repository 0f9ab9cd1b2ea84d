//! Zip-archive source provider.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hostgrid_core::{RevisionKey, Runtime, SourceUri};

use crate::SourceProvider;
use crate::error::{SourceError, SourceResult};

const PARTIAL_SUFFIX: &str = ".partial";

pub struct ArchiveSourceProvider {
    unpack_root: PathBuf,
    archive_dir: PathBuf,
    client: reqwest::Client,
    /// One lock per revision so concurrent callers wait on a single fetch.
    in_flight: Mutex<HashMap<RevisionKey, Arc<Mutex<()>>>>,
}

impl ArchiveSourceProvider {
    pub fn new(unpack_root: &Path, archive_dir: &Path, timeout: Duration) -> SourceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Download {
                url: String::new(),
                source: e,
            })?;
        Ok(Self {
            unpack_root: unpack_root.to_path_buf(),
            archive_dir: archive_dir.to_path_buf(),
            client,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn revision_dir(&self, revision_key: &RevisionKey) -> PathBuf {
        self.unpack_root.join(revision_key.dir_name())
    }

    pub fn archive_path(&self, revision_key: &RevisionKey) -> PathBuf {
        self.archive_dir
            .join(format!("{}.zip", revision_key.dir_name()))
    }

    async fn revision_lock(&self, revision_key: &RevisionKey) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        in_flight
            .entry(revision_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn fetch_archive(&self, uri: &SourceUri, dest: &Path) -> SourceResult<()> {
        if tokio::fs::try_exists(dest).await? {
            debug!(path = %dest.display(), "archive already present");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.archive_dir).await?;
        let partial = with_suffix(dest, PARTIAL_SUFFIX);

        match uri {
            SourceUri::Http { url } => {
                let download_err = |e| SourceError::Download {
                    url: url.clone(),
                    source: e,
                };
                let response = self.client.get(url).send().await.map_err(download_err)?;
                if !response.status().is_success() {
                    return Err(SourceError::DownloadStatus {
                        url: url.clone(),
                        status: response.status().as_u16(),
                    });
                }
                let body = response.bytes().await.map_err(download_err)?;
                tokio::fs::write(&partial, &body).await?;
                info!(%url, bytes = body.len(), "downloaded source archive");
            }
            SourceUri::File { path } => {
                if path == dest {
                    return Ok(());
                }
                tokio::fs::copy(path, &partial).await?;
                debug!(from = %path.display(), "copied source archive");
            }
        }

        tokio::fs::rename(&partial, dest).await?;
        Ok(())
    }
}

#[async_trait]
impl SourceProvider for ArchiveSourceProvider {
    async fn ensure_source(
        &self,
        revision_key: &RevisionKey,
        source_url: &str,
        runtime: Runtime,
    ) -> SourceResult<()> {
        let lock = self.revision_lock(revision_key).await;
        let _guard = lock.lock().await;

        let target = self.revision_dir(revision_key);
        if tokio::fs::try_exists(&target).await? {
            debug!(revision = %revision_key, "source already unpacked");
            return Ok(());
        }

        let uri = SourceUri::parse(source_url)?;
        let archive = self.archive_path(revision_key);
        self.fetch_archive(&uri, &archive).await?;

        let staging = with_suffix(&target, PARTIAL_SUFFIX);
        let final_dir = target.clone();
        tokio::task::spawn_blocking(move || extract(&archive, &staging, &final_dir, runtime))
            .await??;

        info!(revision = %revision_key, %runtime, path = %target.display(), "source unpacked");
        Ok(())
    }

    async fn clean_old_revisions(&self, active: &HashSet<RevisionKey>) -> SourceResult<()> {
        let mut removed = 0usize;

        for (dir, is_archive) in [(&self.unpack_root, false), (&self.archive_dir, true)] {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let stem = if is_archive {
                    match name.strip_suffix(".zip") {
                        Some(stem) => stem,
                        None => continue,
                    }
                } else {
                    name.as_str()
                };
                let Ok(revision_key) = RevisionKey::from_dir_name(stem) else {
                    continue;
                };
                if active.contains(&revision_key) {
                    continue;
                }

                let path = entry.path();
                let result = if is_archive {
                    tokio::fs::remove_file(&path).await
                } else {
                    tokio::fs::remove_dir_all(&path).await
                };
                match result {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %path.display(), "removed stale source");
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale source"),
                }
            }
        }

        self.in_flight
            .lock()
            .await
            .retain(|revision_key, _| active.contains(revision_key));

        if removed > 0 {
            info!(removed, "cleaned old revisions");
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Unpack `archive` into `<staging>/app`, then move staging into place.
fn extract(archive: &Path, staging: &Path, target: &Path, runtime: Runtime) -> SourceResult<()> {
    if staging.exists() {
        std::fs::remove_dir_all(staging)?;
    }
    let app_dir = staging.join("app");
    std::fs::create_dir_all(&app_dir)?;

    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(&app_dir)?;

    if runtime == Runtime::Go {
        std::fs::create_dir_all(staging.join("gopath"))?;
    }

    std::fs::rename(staging, target)?;
    Ok(())
}
