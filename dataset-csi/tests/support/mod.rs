#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    DatasetRecord, DatasetRef, FileReference, LocationEntry, ReferenceKind, VolumeDescriptor,
    VolumeKey, VolumeRef,
};
use dataset_csi::catalog::{Catalog, CatalogProvider, RecordStream};
use dataset_csi::config::{
    KEY_API_ENDPOINT, KEY_API_USER, KEY_DATASET_CREATOR, KEY_DATASET_INDEX_KEY,
    KEY_DATASET_INDEX_URI_REGEXP, KEY_DATASET_NAME, KEY_DATASET_PATH, KEY_DATASET_VERSION,
};
use dataset_csi::error::{CatalogError, LocationDbError, MountError};
use dataset_csi::locationdb::LocationDb;
use dataset_csi::mount::Mounter;
use futures::StreamExt;
use tokio::sync::mpsc;
use tonic::Status;

pub const CREATOR: &str = "admin";
pub const ANNOTATION: &str = "labelX";
pub const URI_PATTERN: &str = r#""url":"([^ ]+)""#;
pub const MOUNT_PREFIX: &str = "/data";

pub type RecordFeed = mpsc::Sender<Result<DatasetRecord, CatalogError>>;

/// In-memory catalog. Every `list_records` call consumes one prepared feed.
#[derive(Default)]
pub struct MockCatalog {
    feeds: Mutex<VecDeque<mpsc::Receiver<Result<DatasetRecord, CatalogError>>>>,
    volumes: Mutex<HashMap<VolumeKey, VolumeDescriptor>>,
    list_calls: AtomicUsize,
    resolve_calls: AtomicUsize,
}

impl MockCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_volume(&self, name: &str, bucket: &str, path: &str) {
        let volume = VolumeRef::volume(CREATOR, name);
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.key(), VolumeDescriptor::new(bucket, path));
    }

    /// Prepares a stream the test keeps feeding; it ends when the sender drops.
    pub fn feed(&self) -> RecordFeed {
        let (tx, rx) = mpsc::channel(16);
        self.feeds.lock().unwrap().push_back(rx);
        tx
    }

    /// Prepares a stream yielding `records` and then ending.
    pub fn feed_records(&self, records: Vec<DatasetRecord>) {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for record in records {
            tx.try_send(Ok(record)).unwrap();
        }
        self.feeds.lock().unwrap().push_back(rx);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn list_records(&self, _dataset: &DatasetRef) -> Result<RecordStream, CatalogError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .feeds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(CatalogError::StreamConsumed)?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn resolve_volume(&self, volume: &VolumeRef) -> Result<VolumeDescriptor, CatalogError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.volumes
            .lock()
            .unwrap()
            .get(&volume.key())
            .cloned()
            .ok_or_else(|| Status::not_found(format!("volume {}", volume.key())).into())
    }
}

pub struct MockProvider(pub Arc<MockCatalog>);

#[async_trait]
impl CatalogProvider for MockProvider {
    async fn catalog(&self, _endpoint: &str, _user: &str) -> Result<Arc<dyn Catalog>, CatalogError> {
        Ok(self.0.clone())
    }
}

/// Drains every entry, leaves a partial file behind and fails.
pub struct FailingDb;

#[async_trait]
impl LocationDb for FailingDb {
    async fn build(
        &self,
        path: &Path,
        mut entries: mpsc::Receiver<LocationEntry>,
    ) -> Result<u64, LocationDbError> {
        while entries.recv().await.is_some() {}
        tokio::fs::write(path, b"partial").await?;
        Err(io::Error::other("disk full").into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        db: PathBuf,
        root: PathBuf,
        target: PathBuf,
    },
    Unmount(PathBuf),
}

#[derive(Default)]
pub struct RecordingMounter {
    pub calls: Mutex<Vec<MountCall>>,
}

impl RecordingMounter {
    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn mount(&self, db_path: &Path, data_root: &Path, target: &Path) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(MountCall::Mount {
            db: db_path.to_path_buf(),
            root: data_root.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        self.calls
            .lock()
            .unwrap()
            .push(MountCall::Unmount(target.to_path_buf()));
        Ok(())
    }
}

pub fn file(volume: &str, key: &str, size: u64) -> FileReference {
    FileReference {
        volume: VolumeRef::volume(CREATOR, volume),
        key: key.to_string(),
        content_length: size,
    }
}

pub fn bucket_file(key: &str) -> FileReference {
    FileReference {
        volume: VolumeRef {
            kind: ReferenceKind::Other("Bucket".to_string()),
            name: "raw".to_string(),
            creator: CREATOR.to_string(),
        },
        key: key.to_string(),
        content_length: 1,
    }
}

pub fn record(files: Vec<FileReference>, label: Option<serde_json::Value>) -> DatasetRecord {
    let mut record = DatasetRecord {
        files,
        ..Default::default()
    };
    if let Some(label) = label {
        record.annotations.insert(ANNOTATION.to_string(), label);
    }
    record
}

/// Catalog with volumes `test1` and `test2` under bucket `fs/to`.
pub fn catalog() -> Arc<MockCatalog> {
    let catalog = MockCatalog::new();
    catalog.add_volume("test1", "fs/to", "test1");
    catalog.add_volume("test2", "fs/to", "test2");
    catalog
}

/// Two records with two files each, labelled cat and dog.
pub fn sample_records() -> Vec<DatasetRecord> {
    vec![
        record(
            vec![file("test1", "file1", 10), file("test1", "file2", 20)],
            Some(serde_json::json!({"url": "http://bucket/to/file", "class": "cat"})),
        ),
        record(
            vec![file("test2", "file3", 30), file("test2", "file4", 40)],
            Some(serde_json::json!({"url": "http://bucket/to/file", "class": "dog"})),
        ),
    ]
}

pub const SAMPLE_INDEX: &str = r#"{"class":"cat","url":"/data/fs/to/test1/file1"}
{"class":"cat","url":"/data/fs/to/test1/file2"}
{"class":"dog","url":"/data/fs/to/test2/file3"}
{"class":"dog","url":"/data/fs/to/test2/file4"}
"#;

pub fn context(with_index: bool) -> HashMap<String, String> {
    let mut ctx: HashMap<String, String> = [
        (KEY_API_ENDPOINT, "catalog:9000"),
        (KEY_API_USER, "ava@example.com"),
        (KEY_DATASET_NAME, "test-ds"),
        (KEY_DATASET_VERSION, "v1"),
        (KEY_DATASET_CREATOR, CREATOR),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    if with_index {
        ctx.insert(KEY_DATASET_INDEX_KEY.to_string(), ANNOTATION.to_string());
        ctx.insert(KEY_DATASET_INDEX_URI_REGEXP.to_string(), URI_PATTERN.to_string());
        ctx.insert(KEY_DATASET_PATH.to_string(), MOUNT_PREFIX.to_string());
    }
    ctx
}

/// Names of the entries of `dir`, sorted.
pub async fn list_dir(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
