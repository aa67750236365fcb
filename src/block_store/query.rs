//! Range-and-predicate query execution over sealed block files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::cache::{BlockCache, BlockKey};
use super::reader::{BlockFileReader, ReaderError};
use crate::event::Event;

/// A time-ranged query with optional attribute predicates.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    /// Inclusive range bounds, nanoseconds.
    pub from_ns: i64,
    pub to_ns: i64,
    pub group: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub uid: Option<String>,
}

impl EventQuery {
    pub fn range(from_ns: i64, to_ns: i64) -> Self {
        Self {
            from_ns,
            to_ns,
            ..Default::default()
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if event.timestamp < self.from_ns || event.timestamp > self.to_ns {
            return false;
        }
        if let Some(group) = &self.group {
            if &event.identity.api_group != group {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &event.identity.kind != kind {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if event.identity.namespace.as_deref() != Some(namespace.as_str()) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &event.identity.name != name {
                return false;
            }
        }
        if let Some(uid) = &self.uid {
            if &event.identity.uid != uid && event.identity.effective_uid() != uid {
                return false;
            }
        }
        true
    }
}

/// Query outcome: matching events plus execution counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueryResult {
    pub events: Vec<Event>,
    pub files_searched: usize,
    pub blocks_scanned: usize,
    pub blocks_skipped: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Per-file failures. A failing file never aborts the query.
    pub errors: Vec<String>,
}

mod duration_millis {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}

/// Executes queries against the block directory.
pub struct QueryExecutor {
    dir: PathBuf,
    cache: Option<Arc<BlockCache>>,
}

impl QueryExecutor {
    pub fn new(dir: PathBuf, cache: Option<Arc<BlockCache>>) -> Self {
        Self { dir, cache }
    }

    /// Lists every sealed hour file. The writer routes late events into
    /// whichever file is open when they arrive, so a file's name does not
    /// bound the timestamps inside it; the per-file index does, and the
    /// range check happens against that index when the file is opened.
    async fn candidate_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_partition_name(name) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn execute(&self, query: &EventQuery) -> QueryResult {
        let started = Instant::now();
        let mut result = QueryResult::default();

        if query.from_ns > query.to_ns {
            result.duration = started.elapsed();
            return result;
        }

        let files = match self.candidate_files().await {
            Ok(files) => files,
            Err(error) => {
                result.errors.push(format!("failed to list block files: {error}"));
                result.duration = started.elapsed();
                return result;
            }
        };

        for path in files {
            if let Err(error) = self.search_file(&path, query, &mut result).await {
                warn!(message = "block file unreadable during query", path = %path.display(), %error);
                result.errors.push(error.to_string());
            }
        }

        result.events.sort_by_key(|e| e.timestamp);
        result.duration = started.elapsed();
        debug!(
            message = "query executed",
            events = result.events.len(),
            files_searched = result.files_searched,
            blocks_scanned = result.blocks_scanned,
            blocks_skipped = result.blocks_skipped,
        );
        result
    }

    async fn search_file(
        &self,
        path: &PathBuf,
        query: &EventQuery,
        result: &mut QueryResult,
    ) -> Result<(), ReaderError> {
        let mut reader = BlockFileReader::open(path).await?;

        let stats = &reader.index().stats;
        if stats.event_count > 0
            && (stats.max_timestamp < query.from_ns || stats.min_timestamp > query.to_ns)
        {
            return Ok(());
        }
        result.files_searched += 1;

        let partition = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let blocks = reader.index().blocks.clone();

        for meta in blocks {
            if !meta.may_match(
                query.from_ns,
                query.to_ns,
                query.group.as_deref(),
                query.kind.as_deref(),
                query.namespace.as_deref(),
            ) {
                result.blocks_skipped += 1;
                continue;
            }

            let key = BlockKey {
                partition: partition.clone(),
                offset: meta.offset,
            };
            let events = if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(&key)) {
                cached
            } else {
                match reader.read_block(&meta).await {
                    Ok(events) => {
                        let events = Arc::new(events);
                        if let Some(cache) = &self.cache {
                            cache.insert(key, Arc::clone(&events), meta.uncompressed_len as usize);
                        }
                        events
                    }
                    Err(error @ ReaderError::ChecksumMismatch { .. }) => {
                        warn!(message = "skipping corrupt block", %error);
                        result.blocks_skipped += 1;
                        result.errors.push(error.to_string());
                        continue;
                    }
                    Err(error) => return Err(error),
                }
            };

            result.blocks_scanned += 1;
            result
                .events
                .extend(events.iter().filter(|e| query.matches(e)).cloned());
        }
        Ok(())
    }
}

pub fn is_partition_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() != 13 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, &b)| match i {
        4 | 7 | 10 => b == b'-',
        _ => b.is_ascii_digit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_name_shape() {
        assert!(is_partition_name("2021-09-05-12"));
        assert!(!is_partition_name("2021-09-05"));
        assert!(!is_partition_name("2021-09-05-12.tmp"));
        assert!(!is_partition_name("not-a-partition"));
    }

    #[test]
    fn predicate_matching() {
        use crate::event::{EventKind, ResourceIdentity, ResourceStatus};

        let event = Event {
            id: uuid::Uuid::nil(),
            timestamp: 500,
            kind: EventKind::Create,
            identity: ResourceIdentity {
                api_group: "apps".into(),
                api_version: "v1".into(),
                kind: "Deployment".into(),
                namespace: Some("default".into()),
                name: "web".into(),
                uid: "u1".into(),
                involved_object_uid: None,
            },
            labels: Default::default(),
            annotations: Default::default(),
            payload: serde_json::json!({}),
            status: ResourceStatus::Ready,
            raw_size: 0,
            normalized_size: 0,
        };

        let mut query = EventQuery::range(0, 1_000);
        assert!(query.matches(&event));

        query.kind = Some("Deployment".into());
        query.namespace = Some("default".into());
        assert!(query.matches(&event));

        query.kind = Some("Pod".into());
        assert!(!query.matches(&event));

        let out_of_range = EventQuery::range(501, 1_000);
        assert!(!out_of_range.matches(&event));
    }
}
