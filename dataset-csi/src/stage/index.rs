use std::path::Path;

use common::DatasetRecord;
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, warn};

use super::cache::VolumeCache;
use crate::config::IndexParams;
use crate::error::StageError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Bytes written, newlines included.
    pub size: u64,
    pub count: u64,
}

/// Writes one line per file reference of every record carrying the index
/// annotation.
pub struct IndexFileBuilder {
    writer: BufWriter<File>,
    annotation_key: String,
    uri_pattern: Option<Regex>,
    mount_prefix: String,
    stats: IndexStats,
}

impl IndexFileBuilder {
    pub async fn create(path: &Path, params: &IndexParams) -> Result<Self, StageError> {
        let file = File::create(path).await?;
        Ok(IndexFileBuilder {
            writer: BufWriter::new(file),
            annotation_key: params.annotation_key.clone(),
            uri_pattern: params.uri_pattern.clone(),
            mount_prefix: params.mount_prefix.clone(),
            stats: IndexStats::default(),
        })
    }

    /// Consumes `records` until the channel closes, then flushes the file.
    ///
    /// With a uri pattern every volume referenced by a record must already be
    /// in `volumes`; the producer resolves it before forwarding the record.
    pub async fn build(
        &mut self,
        mut records: Receiver<DatasetRecord>,
        volumes: &VolumeCache,
    ) -> Result<IndexStats, StageError> {
        while let Some(record) = records.recv().await {
            let Some(annotation) = record.annotations.get(&self.annotation_key) else {
                continue;
            };
            let line = match serde_json::to_string(annotation) {
                Ok(line) => line,
                Err(e) => {
                    warn!("skipping record annotation {}: {e}", self.annotation_key);
                    continue;
                }
            };

            for file in &record.files {
                let mut out = match &self.uri_pattern {
                    None => line.clone(),
                    Some(re) => {
                        if !file.volume.kind.is_volume() {
                            continue;
                        }
                        let volume = volumes.get(&file.volume).await.ok_or_else(|| {
                            StageError::VolumeNotCached(file.volume.key().to_string())
                        })?;
                        let local = volume.local_path(&self.mount_prefix, &file.key);
                        replace_first_group(re, &line, &local)
                    }
                };
                out.push('\n');
                self.writer.write_all(out.as_bytes()).await?;
                self.stats.size += out.len() as u64;
                self.stats.count += 1;
            }
        }
        self.writer.flush().await?;

        debug!(
            "index {} written: {} lines, {} bytes",
            self.annotation_key, self.stats.count, self.stats.size
        );
        Ok(self.stats)
    }
}

/// Replaces the span of capture group 1 in every match of `re` with
/// `replacement`. Matches where the group did not participate are kept as is.
pub fn replace_first_group(re: &Regex, haystack: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len() + replacement.len());
    let mut last = 0;
    for caps in re.captures_iter(haystack) {
        let Some(group) = caps.get(1) else {
            continue;
        };
        out.push_str(&haystack[last..group.start()]);
        out.push_str(replacement);
        last = group.end();
    }
    out.push_str(&haystack[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{FileReference, ReferenceKind, VolumeDescriptor, VolumeRef};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    const ANNOTATION: &str = "labelX";

    fn file(volume: &str, key: &str) -> FileReference {
        FileReference {
            volume: VolumeRef::volume("admin", volume),
            key: key.to_string(),
            content_length: 0,
        }
    }

    fn record(files: Vec<FileReference>, label: Option<serde_json::Value>) -> DatasetRecord {
        DatasetRecord {
            files,
            annotations: label
                .map(|l| BTreeMap::from([(ANNOTATION.to_string(), l)]))
                .unwrap_or_default(),
        }
    }

    fn params(pattern: Option<&str>) -> IndexParams {
        IndexParams {
            annotation_key: ANNOTATION.to_string(),
            uri_pattern: pattern.map(|p| Regex::new(p).unwrap()),
            mount_prefix: "/data".to_string(),
        }
    }

    async fn run(
        params: &IndexParams,
        records: Vec<DatasetRecord>,
        volumes: &VolumeCache,
    ) -> (Result<IndexStats, StageError>, String) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for r in records {
            tx.send(r).await.unwrap();
        }
        drop(tx);

        let mut builder = IndexFileBuilder::create(&path, params).await.unwrap();
        let result = builder.build(rx, volumes).await;
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        (result, content)
    }

    async fn cached_volumes() -> VolumeCache {
        let volumes = VolumeCache::new();
        for name in ["test1", "test2", "test3"] {
            volumes
                .insert(
                    &VolumeRef::volume("admin", name),
                    VolumeDescriptor::new("fs/to", name),
                )
                .await;
        }
        volumes
    }

    #[tokio::test]
    async fn test_build_rewrites_urls() {
        let cat = json!({"url": "http://bucket/to/file", "class": "cat"});
        let dog = json!({"url": "http://bucket/to/file", "class": "dog"});
        let records = vec![
            record(vec![file("test1", "file1"), file("test1", "file2")], Some(cat)),
            record(vec![file("test2", "file3"), file("test2", "file4")], Some(dog)),
            record(vec![file("test3", "file5"), file("test3", "file6")], None),
        ];

        let volumes = cached_volumes().await;
        let (stats, content) = run(&params(Some(r#""url":"([^ ]+)""#)), records, &volumes).await;

        let expected = r#"{"class":"cat","url":"/data/fs/to/test1/file1"}
{"class":"cat","url":"/data/fs/to/test1/file2"}
{"class":"dog","url":"/data/fs/to/test2/file3"}
{"class":"dog","url":"/data/fs/to/test2/file4"}
"#;
        assert_eq!(content, expected);
        let stats = stats.unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.size, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_build_without_pattern_keeps_annotation() {
        let label = json!({"class": "cat", "box": [1, 2.5]});
        let mut other = file("test9", "file9");
        other.volume.kind = ReferenceKind::Other("Bucket".to_string());
        let records = vec![record(vec![file("test1", "file1"), other], Some(label))];

        // nothing needs to be cached without a pattern
        let (stats, content) = run(&params(None), records, &VolumeCache::new()).await;
        let line = r#"{"box":[1,2.5],"class":"cat"}"#;
        assert_eq!(content, format!("{line}\n{line}\n"));
        assert_eq!(stats.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_build_skips_other_kinds_with_pattern() {
        let mut other = file("test9", "file9");
        other.volume.kind = ReferenceKind::Other("Bucket".to_string());
        let records = vec![record(
            vec![other, file("test1", "file1")],
            Some(json!({"url": "s3://x"})),
        )];

        let volumes = cached_volumes().await;
        let (stats, content) = run(&params(Some(r#""url":"([^"]+)""#)), records, &volumes).await;
        assert_eq!(content, "{\"url\":\"/data/fs/to/test1/file1\"}\n");
        assert_eq!(stats.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_build_fails_on_uncached_volume() {
        let records = vec![record(
            vec![file("test1", "file1"), file("missing", "file2")],
            Some(json!({"url": "s3://x"})),
        )];

        let volumes = cached_volumes().await;
        let (stats, _) = run(&params(Some(r#""url":"([^"]+)""#)), records, &volumes).await;
        assert!(matches!(stats, Err(StageError::VolumeNotCached(v)) if v == "admin/missing"));
    }

    #[test]
    fn test_replace_first_group() {
        let re = Regex::new(r#""url":"([^ ]+)""#).unwrap();
        assert_eq!(
            replace_first_group(&re, r#"{"class":"cat","url":"http://x"}"#, "/data/b/p/f1"),
            r#"{"class":"cat","url":"/data/b/p/f1"}"#
        );

        // every non-overlapping match is rewritten
        let re = Regex::new(r"src=(\w+)").unwrap();
        assert_eq!(replace_first_group(&re, "src=a src=b", "L"), "src=L src=L");

        // an unmatched optional group leaves the match untouched
        let re = Regex::new(r"k(\d)?").unwrap();
        assert_eq!(replace_first_group(&re, "k1 k", "N"), "kN k");

        assert_eq!(replace_first_group(&re, "none", "N"), "none");
    }
}
