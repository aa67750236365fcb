//! Hour-partitioned, append-only event storage.
//!
//! One file per UTC hour, each a sequence of compressed blocks with a
//! trailing index enabling metadata-skip queries. The open hour is owned by
//! the writer and invisible to readers until sealed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;

pub mod cache;
pub mod export;
pub mod format;
pub mod query;
pub mod reader;
pub mod writer;

pub use cache::BlockCache;
pub use query::{EventQuery, QueryExecutor, QueryResult};

use crate::event::Event;
use format::FinalState;
use query::is_partition_name;
use reader::BlockFileReader;
use writer::{BlockFileWriter, WriterError};

#[derive(Debug, Snafu)]
pub enum BlockStoreError {
    #[snafu(display("failed to prepare block directory {}: {}", path.display(), source))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to scan block directory {}: {}", path.display(), source))]
    ScanDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("block write failed: {}", source))]
    Write { source: WriterError },
}

/// Aggregated view of what the store holds, for the metadata endpoint.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreMetadata {
    pub event_count: u64,
    pub file_count: usize,
    pub kinds: BTreeMap<String, u64>,
    pub namespaces: BTreeMap<String, u64>,
}

struct WriterState {
    current: Option<BlockFileWriter>,
    /// Last appended timestamp per uid, for the strict monotonicity
    /// invariant.
    last_timestamps: HashMap<String, i64>,
}

/// The block store: a single writer plus a shared query executor.
pub struct BlockStore {
    dir: PathBuf,
    segment_size: usize,
    state: Mutex<WriterState>,
    executor: QueryExecutor,
}

impl BlockStore {
    /// Opens the store, creating the directory if needed and salvaging any
    /// partial files left behind by a crash.
    pub async fn open(
        dir: impl Into<PathBuf>,
        segment_size: usize,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Self, BlockStoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .context(CreateDirSnafu { path: dir.clone() })?;

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(ScanDirSnafu { path: dir.clone() })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ScanDirSnafu { path: dir.clone() })?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') && name.ends_with(".tmp") {
                if let Err(error) = writer::recover_partial(&entry.path()).await {
                    warn!(message = "failed to recover partial file", path = %entry.path().display(), %error);
                }
            }
        }

        let executor = QueryExecutor::new(dir.clone(), cache);
        Ok(Self {
            dir,
            segment_size,
            state: Mutex::new(WriterState {
                current: None,
                last_timestamps: HashMap::new(),
            }),
            executor,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Appends one event, adjusting its timestamp if needed so per-uid
    /// timestamps stay strictly monotonic, and rotating the hourly file when
    /// the event belongs to a newer hour.
    pub async fn append(&self, mut event: Event) -> Result<(), BlockStoreError> {
        let mut state = self.state.lock().await;

        let last = state
            .last_timestamps
            .get(&event.identity.uid)
            .copied()
            .unwrap_or(i64::MIN);
        if event.timestamp <= last {
            event.timestamp = last + 1;
        }
        state
            .last_timestamps
            .insert(event.identity.uid.clone(), event.timestamp);

        let partition = event.hour_partition();
        let rotate = match &state.current {
            Some(writer) => partition.as_str() > writer.partition(),
            None => true,
        };
        if rotate {
            if let Some(writer) = state.current.take() {
                writer.close().await.context(WriteSnafu)?;
            }
            state.current = Some(
                BlockFileWriter::create(&self.dir, &partition, self.segment_size)
                    .await
                    .context(WriteSnafu)?,
            );
        }

        state
            .current
            .as_mut()
            .expect("writer initialized above")
            .append(&event)
            .await
            .context(WriteSnafu)
    }

    /// Seals and closes the open hour, if any. Called on shutdown.
    pub async fn flush(&self) -> Result<(), BlockStoreError> {
        let mut state = self.state.lock().await;
        if let Some(writer) = state.current.take() {
            writer.close().await.context(WriteSnafu)?;
        }
        Ok(())
    }

    pub async fn query(&self, query: &EventQuery) -> QueryResult {
        self.executor.execute(query).await
    }

    /// Sealed hour files intersecting the given nanosecond range, sorted.
    pub async fn sealed_files(
        &self,
        from_ns: i64,
        to_ns: i64,
    ) -> Result<Vec<PathBuf>, BlockStoreError> {
        let from = crate::event::hour_partition(from_ns.saturating_sub(3_600_000_000_000));
        let to = crate::event::hour_partition(to_ns);
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .context(ScanDirSnafu { path: self.dir.clone() })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ScanDirSnafu { path: self.dir.clone() })?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_partition_name(name) && name >= from.as_str() && name <= to.as_str() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// A full file image of the open hour, or `None` when nothing is open.
    pub async fn open_hour_snapshot(
        &self,
    ) -> Result<Option<(String, Vec<u8>)>, BlockStoreError> {
        let mut state = self.state.lock().await;
        match state.current.as_mut() {
            Some(writer) => {
                let partition = writer.partition().to_string();
                let image = writer.snapshot().await.context(WriteSnafu)?;
                Ok(Some((partition, image)))
            }
            None => Ok(None),
        }
    }

    /// Aggregates index statistics across all sealed files.
    pub async fn metadata(&self) -> Result<StoreMetadata, BlockStoreError> {
        let mut meta = StoreMetadata::default();
        for path in self.sealed_files(i64::MIN + 3_600_000_000_000, i64::MAX).await? {
            let reader = match BlockFileReader::open(&path).await {
                Ok(reader) => reader,
                Err(error) => {
                    warn!(message = "skipping unreadable file in metadata scan", path = %path.display(), %error);
                    continue;
                }
            };
            let stats = &reader.index().stats;
            meta.event_count += stats.event_count;
            meta.file_count += 1;
            for (kind, count) in &stats.kinds {
                *meta.kinds.entry(kind.clone()).or_insert(0) += count;
            }
            for (ns, count) in &stats.namespaces {
                *meta.namespaces.entry(ns.clone()).or_insert(0) += count;
            }
        }
        Ok(meta)
    }

    /// The most recent final state recorded for a uid across sealed files.
    pub async fn final_state(&self, uid: &str) -> Result<Option<FinalState>, BlockStoreError> {
        let mut newest: Option<FinalState> = None;
        for path in self.sealed_files(i64::MIN + 3_600_000_000_000, i64::MAX).await? {
            let reader = match BlockFileReader::open(&path).await {
                Ok(reader) => reader,
                Err(_) => continue,
            };
            if let Some(state) = reader.index().final_states.get(uid) {
                let replace = newest
                    .as_ref()
                    .map(|n| state.timestamp > n.timestamp)
                    .unwrap_or(true);
                if replace {
                    newest = Some(state.clone());
                }
            }
        }
        Ok(newest)
    }
}
