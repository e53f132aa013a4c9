//! Staging of dataset volumes.
//!
//! A stage builds the file-location database of a dataset version, and an
//! optional line index of one annotation, under the staging directory of the
//! volume. Both artifacts are written to temporary files and renamed into
//! place only after the whole pipeline succeeded.

pub mod cache;
pub mod flight;
pub mod index;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{DatasetRecord, LocationEntry};
use futures::StreamExt;
use tokio::sync::mpsc::{self, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogProvider, RecordStream};
use crate::config::{DEFAULT_STAGE_WAIT, IndexParams, StageParams};
use crate::error::StageError;
use crate::locationdb::LocationDb;
use cache::VolumeCache;
use flight::StagingFlights;
use index::IndexFileBuilder;

pub const DATASET_DB_NAME: &str = "dataset.db";
pub const DATASET_INDEX_DIRECTORY: &str = "atom-dataset-index";
pub const CHANNEL_CAPACITY: usize = 100;

pub fn db_path(staging_dir: &Path) -> PathBuf {
    staging_dir.join(DATASET_DB_NAME)
}

pub fn index_dir(staging_dir: &Path) -> PathBuf {
    staging_dir.join(DATASET_INDEX_DIRECTORY)
}

pub fn index_path(staging_dir: &Path, annotation_key: &str) -> PathBuf {
    index_dir(staging_dir).join(annotation_key)
}

/// Coordinates staging requests: one build per volume id at a time, every
/// caller bounded by the wait timeout.
pub struct Stager {
    catalogs: Arc<dyn CatalogProvider>,
    db: Arc<dyn LocationDb>,
    flights: StagingFlights,
    wait_timeout: Duration,
    shutdown: CancellationToken,
}

impl Stager {
    pub fn new(catalogs: Arc<dyn CatalogProvider>, db: Arc<dyn LocationDb>) -> Self {
        Stager {
            catalogs,
            db,
            flights: StagingFlights::new(),
            wait_timeout: DEFAULT_STAGE_WAIT,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Stages `volume_id` into `staging_dir`.
    ///
    /// A caller arriving while a build for the same volume id runs attaches to
    /// it, whatever its own parameters. A caller that is not answered within
    /// the wait timeout gets [`StageError::Busy`]; the build keeps running.
    pub async fn stage(
        &self,
        volume_id: &str,
        staging_dir: &Path,
        params: StageParams,
    ) -> Result<(), StageError> {
        let flight = self
            .flights
            .join(volume_id, || {
                let build = StagingBuild {
                    volume_id: volume_id.to_string(),
                    staging_dir: staging_dir.to_path_buf(),
                    params,
                    catalogs: self.catalogs.clone(),
                    db: self.db.clone(),
                    cancel: self.shutdown.child_token(),
                };
                async move { build.run().await.map_err(Arc::new) }
            })
            .await;

        match tokio::time::timeout(self.wait_timeout, flight).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StageError::Shared(e)),
            Err(_) => {
                warn!(
                    "volume {volume_id} still staging after {:?}",
                    self.wait_timeout
                );
                Err(StageError::Busy(volume_id.to_string()))
            }
        }
    }

    pub async fn is_staging(&self, volume_id: &str) -> bool {
        self.flights.is_in_flight(volume_id).await
    }

    /// Cancels every running build at its next record.
    pub fn shutdown(&self) {
        info!("canceling running stage builds");
        self.shutdown.cancel();
    }
}

struct StagingBuild {
    volume_id: String,
    staging_dir: PathBuf,
    params: StageParams,
    catalogs: Arc<dyn CatalogProvider>,
    db: Arc<dyn LocationDb>,
    cancel: CancellationToken,
}

/// Temporary and final paths of one artifact.
struct Artifact {
    tmp: PathBuf,
    target: PathBuf,
}

impl StagingBuild {
    async fn run(self) -> Result<(), StageError> {
        let db = Artifact {
            tmp: self.staging_dir.join(format!("db-{}", Uuid::new_v4())),
            target: db_path(&self.staging_dir),
        };
        let index = self.params.index.as_ref().map(|p| Artifact {
            tmp: self.staging_dir.join(format!("index-{}", Uuid::new_v4())),
            target: index_path(&self.staging_dir, &p.annotation_key),
        });

        if self.already_staged(&db, index.as_ref()).await? {
            info!(
                "volume {} already staged at {}, reusing it",
                self.volume_id,
                self.staging_dir.display()
            );
            return Ok(());
        }

        info!(
            "staging volume {} from dataset {} into {}",
            self.volume_id,
            self.params.dataset,
            self.staging_dir.display()
        );
        let mut committed = Committed::default();
        let result = match self.build(&db, index.as_ref()).await {
            Ok(files) => commit(&db, index.as_ref(), &mut committed)
                .await
                .map(|()| files),
            Err(e) => Err(e),
        };

        match result {
            Ok(files) => {
                committed.finish().await;
                info!("volume {} staged with {files} files", self.volume_id);
                Ok(())
            }
            Err(e) => {
                error!("failed to stage volume {}: {e}", self.volume_id);
                cleanup(&db, index.as_ref(), &committed).await;
                Err(e)
            }
        }
    }

    async fn already_staged(
        &self,
        db: &Artifact,
        index: Option<&Artifact>,
    ) -> Result<bool, StageError> {
        if !tokio::fs::try_exists(&db.target).await? {
            return Ok(false);
        }
        match index {
            Some(index) => Ok(tokio::fs::try_exists(&index.target).await?),
            None => Ok(true),
        }
    }

    /// Runs the producer, the index builder and the database builder until
    /// all of them are done. Returns the number of file entries produced.
    async fn build(&self, db: &Artifact, index: Option<&Artifact>) -> Result<u64, StageError> {
        let catalog = self
            .catalogs
            .catalog(&self.params.endpoint, &self.params.user)
            .await?;
        let records = catalog.list_records(&self.params.dataset).await?;

        let volumes = VolumeCache::new();
        let (entry_tx, entry_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (record_tx, index_job) = match (self.params.index.as_ref(), index) {
            (Some(params), Some(artifact)) => {
                let (record_tx, records) = mpsc::channel(CHANNEL_CAPACITY);
                let job = IndexJob {
                    params,
                    tmp: &artifact.tmp,
                    records,
                    entries: entry_tx.clone(),
                };
                (Some(record_tx), Some(job))
            }
            _ => (None, None),
        };

        let producer = produce(
            records,
            catalog.as_ref(),
            &volumes,
            entry_tx,
            record_tx,
            &self.cancel,
        );
        let indexer = async {
            match index_job {
                Some(job) => job.run(&volumes, &self.staging_dir).await,
                None => Ok(()),
            }
        };
        let database = async {
            self.db
                .build(&db.tmp, entry_rx)
                .await
                .map_err(StageError::from)
        };

        let (files, (), written) = tokio::try_join!(producer, indexer, database)?;
        debug!(
            "volume {}: {files} file entries produced, {written} database rows",
            self.volume_id
        );
        Ok(files)
    }
}

/// Reads the record stream and fans it out to the database and index channels.
///
/// Owns its senders: dropping them at end of stream is what lets the
/// consumers finish.
async fn produce(
    mut records: RecordStream,
    catalog: &dyn Catalog,
    volumes: &VolumeCache,
    entries: Sender<LocationEntry>,
    index_records: Option<Sender<DatasetRecord>>,
    cancel: &CancellationToken,
) -> Result<u64, StageError> {
    let mut files = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Canceled),
            next = records.next() => next,
        };
        let Some(record) = next else {
            break;
        };
        let record = record.map_err(StageError::Stream)?;

        for file in &record.files {
            if !file.volume.kind.is_volume() {
                trace!("skipping {:?} reference {}", file.volume.kind, file.key);
                continue;
            }
            let volume = volumes.resolve(&file.volume, catalog).await?;
            let entry = LocationEntry::new(volume.file_path(&file.key), file.content_length);
            trace!("file entry {}, size: {}", entry.path, entry.size);
            entries
                .send(entry)
                .await
                .map_err(|_| StageError::ChannelClosed("location entry"))?;
            files += 1;
        }

        if let Some(tx) = &index_records {
            tx.send(record)
                .await
                .map_err(|_| StageError::ChannelClosed("index record"))?;
        }
    }
    Ok(files)
}

struct IndexJob<'a> {
    params: &'a IndexParams,
    tmp: &'a Path,
    records: mpsc::Receiver<DatasetRecord>,
    /// Second sender of the database channel, kept until the index entry is in.
    entries: Sender<LocationEntry>,
}

impl IndexJob<'_> {
    async fn run(self, volumes: &VolumeCache, staging_dir: &Path) -> Result<(), StageError> {
        let mut builder = IndexFileBuilder::create(self.tmp, self.params).await?;
        let stats = builder.build(self.records, volumes).await?;

        let entry = LocationEntry::new(
            common::path::join([DATASET_INDEX_DIRECTORY, self.params.annotation_key.as_str()]),
            stats.size,
        )
        .with_root(staging_dir);
        self.entries
            .send(entry)
            .await
            .map_err(|_| StageError::ChannelClosed("location entry"))?;
        Ok(())
    }
}

/// A final path this call renamed over, with a hard link to what it held before.
struct Replaced {
    target: PathBuf,
    backup: Option<PathBuf>,
}

/// What a commit changed so far.
#[derive(Default)]
struct Committed {
    replaced: Vec<Replaced>,
    created_dir: Option<PathBuf>,
}

impl Committed {
    async fn finish(&self) {
        for backup in self.replaced.iter().filter_map(|r| r.backup.as_ref()) {
            remove_quietly(backup).await;
        }
    }

    /// Puts every replaced final path back the way it was, newest first.
    async fn roll_back(&self) {
        for replaced in self.replaced.iter().rev() {
            match &replaced.backup {
                Some(backup) => match tokio::fs::rename(backup, &replaced.target).await {
                    Ok(()) => debug!("restored {}", replaced.target.display()),
                    Err(e) => warn!("failed to restore {}: {e}", replaced.target.display()),
                },
                None => remove_quietly(&replaced.target).await,
            }
        }
        if let Some(dir) = &self.created_dir {
            // fails when not empty, which leaves it in place
            if let Err(e) = tokio::fs::remove_dir(dir).await {
                debug!("kept {}: {e}", dir.display());
            }
        }
    }
}

/// Renames the database, then the index. Each final path that already exists
/// is hard linked aside first so a later failure can restore it.
async fn commit(
    db: &Artifact,
    index: Option<&Artifact>,
    committed: &mut Committed,
) -> Result<(), StageError> {
    replace(db, committed).await?;

    if let Some(index) = index {
        if let Some(dir) = index.target.parent() {
            if !tokio::fs::try_exists(dir).await? {
                tokio::fs::create_dir_all(dir).await?;
                committed.created_dir = Some(dir.to_path_buf());
            }
        }
        replace(index, committed).await?;
    }
    Ok(())
}

async fn replace(artifact: &Artifact, committed: &mut Committed) -> Result<(), StageError> {
    let backup = artifact.tmp.with_extension("prev");
    let backup = match tokio::fs::hard_link(&artifact.target, &backup).await {
        Ok(()) => Some(backup),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    committed.replaced.push(Replaced {
        target: artifact.target.clone(),
        backup,
    });
    tokio::fs::rename(&artifact.tmp, &artifact.target).await?;
    Ok(())
}

async fn cleanup(db: &Artifact, index: Option<&Artifact>, committed: &Committed) {
    committed.roll_back().await;
    for tmp in std::iter::once(&db.tmp).chain(index.map(|i| &i.tmp)) {
        remove_quietly(tmp).await;
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {e}", path.display()),
    }
}
