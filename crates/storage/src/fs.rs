//! Filesystem backup store.
//!
//! Layout under the mount root:
//! `upload-service-data/<id[0:2]>/<id[2:4]>/{raw_<id>, metadata_<id>}`.
//! Writes land in a temp file with a random 12-hex suffix and are renamed
//! into place, so a crash never leaves a half-written raw artifact under
//! its final name. Quarantine renames artifacts to a `quarantine_` prefix;
//! a janitor sweep reclaims them later.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anchorage_primitives::{ByteCount, DataItemId};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng as _;
use tokio::io::AsyncWriteExt as _;

use crate::{
    breaker::{BreakerError, CircuitBreaker},
    sink::{ByteSink, SinkError, SinkReport},
};

const DATA_DIR: &str = "upload-service-data";
const RAW_PREFIX: &str = "raw_";
const METADATA_PREFIX: &str = "metadata_";
const QUARANTINE_PREFIX: &str = "quarantine_";

/// Paths for one data item.
#[derive(Debug, Clone)]
pub struct ItemPaths {
    pub dir: PathBuf,
    pub raw: PathBuf,
    pub metadata: PathBuf,
}

/// The EFS-style backup store.
#[derive(Debug, Clone)]
pub struct FsBackupStore {
    root: PathBuf,
    breaker: Arc<CircuitBreaker>,
}

impl FsBackupStore {
    pub fn new(mount_point: impl Into<PathBuf>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            root: mount_point.into().join(DATA_DIR),
            breaker,
        }
    }

    /// Shard directories on the first four id characters to keep directory
    /// fan-in bounded.
    pub fn paths(&self, id: &DataItemId) -> ItemPaths {
        let rendered = id.to_string();
        let dir = self.root.join(&rendered[0..2]).join(&rendered[2..4]);
        ItemPaths {
            raw: dir.join(format!("{RAW_PREFIX}{rendered}")),
            metadata: dir.join(format!("{METADATA_PREFIX}{rendered}")),
            dir,
        }
    }

    /// Opens a streaming raw-file writer for `id`.
    pub async fn begin_raw_write(&self, id: &DataItemId) -> Result<FsRawSink, SinkError> {
        let paths = self.paths(id);
        let temp = temp_path(&paths.raw);
        let file = self
            .breaker
            .call(async {
                tokio::fs::create_dir_all(&paths.dir).await?;
                tokio::fs::File::create(&temp).await
            })
            .await
            .map_err(fs_breaker_error)?;
        Ok(FsRawSink {
            store: self.clone(),
            paths,
            temp,
            file,
            bytes_written: 0,
        })
    }

    /// Writes the metadata file: ASCII `<contentType>;<payloadDataStart>`.
    pub async fn write_metadata(
        &self,
        id: &DataItemId,
        content_type: &str,
        payload_data_start: ByteCount,
    ) -> Result<(), SinkError> {
        let paths = self.paths(id);
        let temp = temp_path(&paths.metadata);
        let body = format!("{content_type};{payload_data_start}");
        self.breaker
            .call(async {
                tokio::fs::create_dir_all(&paths.dir).await?;
                tokio::fs::write(&temp, body.as_bytes()).await?;
                tokio::fs::rename(&temp, &paths.metadata).await
            })
            .await
            .map_err(fs_breaker_error)
    }

    /// Reads a raw artifact back (janitor tooling, finalize recovery).
    pub async fn read_raw(&self, id: &DataItemId) -> Result<Option<Bytes>, SinkError> {
        let paths = self.paths(id);
        match tokio::fs::read(&paths.raw).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(fs_error(&error)),
        }
    }

    /// Renames both artifacts to the quarantine prefix. Missing files are
    /// fine: quarantine runs on whatever made it to disk.
    pub async fn quarantine(&self, id: &DataItemId) -> Result<(), SinkError> {
        let paths = self.paths(id);
        for path in [&paths.raw, &paths.metadata] {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let target = path.with_file_name(format!("{QUARANTINE_PREFIX}{name}"));
            match tokio::fs::rename(path, &target).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(fs_error(&error)),
            }
        }
        metrics::counter!("fs_quarantined_total").increment(1);
        Ok(())
    }

    /// Janitor sweep: deletes quarantined artifacts, returning how many
    /// files were reclaimed.
    pub async fn reclaim_quarantined(&self) -> Result<u64, SinkError> {
        let mut reclaimed = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(fs_error(&error)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| fs_error(&e))? {
                let path = entry.path();
                if entry.file_type().await.map_err(|e| fs_error(&e))?.is_dir() {
                    stack.push(path);
                } else if path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(QUARANTINE_PREFIX))
                {
                    tokio::fs::remove_file(&path).await.map_err(|e| fs_error(&e))?;
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }
}

/// Streaming writer created by [`FsBackupStore::begin_raw_write`].
pub struct FsRawSink {
    store: FsBackupStore,
    paths: ItemPaths,
    temp: PathBuf,
    file: tokio::fs::File,
    bytes_written: u64,
}

#[async_trait]
impl ByteSink for FsRawSink {
    fn label(&self) -> &'static str {
        "fs"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.file
            .write_all(&chunk)
            .await
            .map_err(|e| fs_error(&e))?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<SinkReport, SinkError> {
        let this = *self;
        let mut file = this.file;
        let result = this
            .store
            .breaker
            .call(async {
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                tokio::fs::rename(&this.temp, &this.paths.raw).await
            })
            .await
            .map_err(fs_breaker_error);
        if let Err(error) = result {
            let _ = tokio::fs::remove_file(&this.temp).await;
            return Err(error);
        }
        Ok(SinkReport {
            label: "fs",
            bytes_written: ByteCount(this.bytes_written),
            etag: None,
        })
    }

    async fn abort(self: Box<Self>) {
        let this = *self;
        drop(this.file);
        if let Err(error) = tokio::fs::remove_file(&this.temp).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(temp = %this.temp.display(), %error, "failed to remove temp file");
        }
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..12)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).expect("hex digit"))
            .collect()
    };
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("artifact");
    target.with_file_name(format!("{name}.{suffix}"))
}

fn fs_error(error: &std::io::Error) -> SinkError {
    SinkError::Fs {
        message: error.to_string(),
    }
}

fn fs_breaker_error(error: BreakerError<std::io::Error>) -> SinkError {
    match error {
        BreakerError::Open { name } | BreakerError::Timeout { name } => {
            SinkError::CircuitOpen { target: name }
        }
        BreakerError::Inner(io) => fs_error(&io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;

    fn store(root: &Path) -> FsBackupStore {
        FsBackupStore::new(
            root,
            Arc::new(CircuitBreaker::new("fs", BreakerConfig::default())),
        )
    }

    fn sample_id() -> DataItemId {
        DataItemId::from_signature(b"fs store tests")
    }

    #[tokio::test]
    async fn raw_write_is_atomic_and_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = sample_id();

        let mut sink = Box::new(store.begin_raw_write(&id).await.unwrap());
        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        let report = sink.finish().await.unwrap();
        assert_eq!(report.bytes_written, ByteCount(11));

        let paths = store.paths(&id);
        let rendered = id.to_string();
        assert!(paths.raw.ends_with(
            Path::new(&rendered[0..2])
                .join(&rendered[2..4])
                .join(format!("raw_{rendered}"))
        ));
        assert_eq!(store.read_raw(&id).await.unwrap().unwrap(), "hello world");
        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(&paths.dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains('.'))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn abort_removes_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = sample_id();

        let mut sink = Box::new(store.begin_raw_write(&id).await.unwrap());
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.abort().await;

        assert!(store.read_raw(&id).await.unwrap().is_none());
        let paths = store.paths(&id);
        assert_eq!(std::fs::read_dir(&paths.dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn metadata_format_is_content_type_semicolon_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = sample_id();
        store
            .write_metadata(&id, "text/plain", ByteCount(1149))
            .await
            .unwrap();
        let paths = store.paths(&id);
        let body = std::fs::read_to_string(&paths.metadata).unwrap();
        assert_eq!(body, "text/plain;1149");
    }

    #[tokio::test]
    async fn quarantine_renames_and_janitor_reclaims() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = sample_id();

        let mut sink = Box::new(store.begin_raw_write(&id).await.unwrap());
        sink.write(Bytes::from_static(b"suspicious")).await.unwrap();
        sink.finish().await.unwrap();
        store
            .write_metadata(&id, "application/octet-stream", ByteCount(10))
            .await
            .unwrap();

        store.quarantine(&id).await.unwrap();
        assert!(store.read_raw(&id).await.unwrap().is_none());
        let paths = store.paths(&id);
        let rendered = id.to_string();
        assert!(paths.dir.join(format!("quarantine_raw_{rendered}")).exists());
        assert!(
            paths
                .dir
                .join(format!("quarantine_metadata_{rendered}"))
                .exists()
        );

        assert_eq!(store.reclaim_quarantined().await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(&paths.dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn quarantine_of_nothing_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.quarantine(&sample_id()).await.unwrap();
    }
}
