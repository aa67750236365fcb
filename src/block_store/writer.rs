//! Streaming writer for hourly block files.
//!
//! Events append into an in-memory buffer of newline-delimited JSON. When the
//! buffer reaches the configured segment target the block is compressed,
//! checksummed, and appended behind its metadata. The file is written under a
//! temporary name and only renamed into place once the trailing index has
//! been appended, so readers never observe a file without an index. Partial
//! files left behind by a crash are salvaged block-by-block on startup, with
//! the unsealed tail discarded.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use crc32fast::Hasher;
use flate2::write::GzEncoder;
use flate2::Compression;
use snafu::{ResultExt, Snafu};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::format::{
    BlockMeta, Codec, FileFooter, FileHeader, FileIndex, FileStats, FinalState, HEADER_LEN,
};
use super::reader;
use crate::event::Event;

#[derive(Debug, Snafu)]
pub enum WriterError {
    #[snafu(display("write I/O error on {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to encode event as JSON: {}", source))]
    EncodeEvent { source: serde_json::Error },

    #[snafu(display("failed to encode block metadata: {}", source))]
    EncodeMeta { source: serde_json::Error },

    #[snafu(display("failed to encode file index: {}", source))]
    EncodeIndex { source: serde_json::Error },
}

/// Accumulates the per-block summary while events stream in.
#[derive(Debug, Default)]
struct PendingBlock {
    buf: Vec<u8>,
    event_count: u32,
    min_timestamp: i64,
    max_timestamp: i64,
    groups: BTreeSet<String>,
    kinds: BTreeSet<String>,
    namespaces: BTreeSet<String>,
}

impl PendingBlock {
    fn new() -> Self {
        Self {
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    fn observe(&mut self, event: &Event, line: &[u8]) {
        self.buf.extend_from_slice(line);
        self.buf.push(b'\n');
        self.event_count += 1;
        self.min_timestamp = self.min_timestamp.min(event.timestamp);
        self.max_timestamp = self.max_timestamp.max(event.timestamp);
        self.groups.insert(event.identity.api_group.clone());
        self.kinds.insert(event.identity.kind.clone());
        if let Some(ns) = &event.identity.namespace {
            self.namespaces.insert(ns.clone());
        }
    }
}

fn seal(pending: &PendingBlock, offset: u64) -> Result<(BlockMeta, Vec<u8>), WriterError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&pending.buf)
        .and_then(|_| encoder.finish())
        .map(|compressed| {
            let mut hasher = Hasher::new();
            hasher.update(&compressed);
            let checksum = hasher.finalize();
            let meta = BlockMeta {
                offset,
                compressed_len: compressed.len() as u32,
                uncompressed_len: pending.buf.len() as u32,
                event_count: pending.event_count,
                checksum,
                min_timestamp: pending.min_timestamp,
                max_timestamp: pending.max_timestamp,
                groups: pending.groups.clone(),
                kinds: pending.kinds.clone(),
                namespaces: pending.namespaces.clone(),
            };
            (meta, compressed)
        })
        .map_err(|source| WriterError::Io {
            path: PathBuf::from("<gzip>"),
            source,
        })
}

/// Writer for a single hourly file.
pub struct BlockFileWriter {
    partition: String,
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: File,
    offset: u64,
    segment_size: usize,
    pending: PendingBlock,
    blocks: Vec<BlockMeta>,
    stats: FileStats,
    final_states: BTreeMap<String, FinalState>,
}

impl BlockFileWriter {
    /// Opens the writer for the given hourly partition under `dir`.
    pub async fn create(
        dir: &Path,
        partition: &str,
        segment_size: usize,
    ) -> Result<Self, WriterError> {
        let final_path = dir.join(partition);
        let tmp_path = dir.join(format!(".{partition}.tmp"));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .context(IoSnafu { path: tmp_path.clone() })?;

        let header = FileHeader::new(
            Codec::Gzip,
            segment_size as u32,
            Utc::now().timestamp(),
        );
        file.write_all(&header.encode())
            .await
            .context(IoSnafu { path: tmp_path.clone() })?;

        Ok(Self {
            partition: partition.to_string(),
            final_path,
            tmp_path,
            file,
            offset: HEADER_LEN as u64,
            segment_size,
            pending: PendingBlock::new(),
            blocks: Vec::new(),
            stats: FileStats {
                min_timestamp: i64::MAX,
                max_timestamp: i64::MIN,
                ..Default::default()
            },
            final_states: BTreeMap::new(),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Appends one event, sealing the current block if the uncompressed
    /// buffer has reached the segment target.
    pub async fn append(&mut self, event: &Event) -> Result<(), WriterError> {
        let line = serde_json::to_vec(event).context(EncodeEventSnafu)?;
        self.pending.observe(event, &line);

        self.stats.event_count += 1;
        self.stats.min_timestamp = self.stats.min_timestamp.min(event.timestamp);
        self.stats.max_timestamp = self.stats.max_timestamp.max(event.timestamp);
        *self
            .stats
            .kinds
            .entry(event.identity.kind.clone())
            .or_insert(0) += 1;
        if let Some(ns) = &event.identity.namespace {
            *self.stats.namespaces.entry(ns.clone()).or_insert(0) += 1;
        }
        self.final_states.insert(
            event.identity.uid.clone(),
            FinalState {
                kind: event.identity.kind.clone(),
                namespace: event.identity.namespace.clone(),
                name: event.identity.name.clone(),
                event_kind: event.kind,
                status: event.status,
                timestamp: event.timestamp,
            },
        );

        if self.pending.buf.len() >= self.segment_size {
            self.seal_pending().await?;
        }
        Ok(())
    }

    async fn seal_pending(&mut self) -> Result<(), WriterError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::replace(&mut self.pending, PendingBlock::new());

        // The payload offset accounts for the length-prefixed metadata that
        // precedes it, so the meta must be encoded twice: once with a
        // provisional offset to learn its own size, once for real.
        let provisional = seal(&pending, 0)?;
        let meta_len = provisional
            .0
            .encode_prefixed()
            .context(EncodeMetaSnafu)?
            .len();
        let (mut meta, compressed) = provisional;
        meta.offset = self.offset + meta_len as u64;

        let meta_bytes = meta.encode_prefixed().context(EncodeMetaSnafu)?;
        self.file
            .write_all(&meta_bytes)
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;
        self.file
            .write_all(&compressed)
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;
        // A sealed block is the unit of crash safety; flush it all the way
        // down before acknowledging.
        self.file
            .flush()
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;

        self.offset += (meta_bytes.len() + compressed.len()) as u64;
        trace!(
            message = "sealed block",
            partition = %self.partition,
            events = meta.event_count,
            compressed_len = meta.compressed_len,
            uncompressed_len = meta.uncompressed_len,
        );
        self.blocks.push(meta);
        Ok(())
    }

    fn build_index(&self, extra: Option<&BlockMeta>) -> FileIndex {
        let mut blocks = self.blocks.clone();
        if let Some(extra) = extra {
            blocks.push(extra.clone());
        }
        let mut stats = self.stats.clone();
        if stats.event_count == 0 {
            stats.min_timestamp = 0;
            stats.max_timestamp = 0;
        }
        FileIndex {
            stats,
            final_states: self.final_states.clone(),
            blocks,
        }
    }

    /// Seals any pending events, appends the index and footer, syncs, and
    /// renames the file into place. The writer is consumed.
    pub async fn close(mut self) -> Result<PathBuf, WriterError> {
        self.seal_pending().await?;

        let index = self.build_index(None);
        let index_bytes = index.encode().context(EncodeIndexSnafu)?;
        let footer = FileFooter {
            index_offset: self.offset,
            index_len: index_bytes.len() as u64,
        };

        self.file
            .write_all(&index_bytes)
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;
        self.file
            .write_all(&footer.encode())
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;
        self.file
            .sync_all()
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;

        tokio::fs::rename(&self.tmp_path, &self.final_path)
            .await
            .context(IoSnafu { path: self.final_path.clone() })?;

        debug!(
            message = "closed block file",
            partition = %self.partition,
            events = index.stats.event_count,
            blocks = index.blocks.len(),
        );
        Ok(self.final_path)
    }

    /// Produces the bytes of a complete, well-formed file image reflecting
    /// everything appended so far, including the still-open block. Used by
    /// export when the open hour is requested; the writer itself is left
    /// untouched.
    pub async fn snapshot(&mut self) -> Result<Vec<u8>, WriterError> {
        self.file
            .flush()
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;
        let mut image = tokio::fs::read(&self.tmp_path)
            .await
            .context(IoSnafu { path: self.tmp_path.clone() })?;
        image.truncate(self.offset as usize);

        let mut tail_meta = None;
        if !self.pending.is_empty() {
            let provisional = seal(&self.pending, 0)?;
            let meta_len = provisional
                .0
                .encode_prefixed()
                .context(EncodeMetaSnafu)?
                .len();
            let (mut meta, compressed) = provisional;
            meta.offset = self.offset + meta_len as u64;
            image.extend_from_slice(&meta.encode_prefixed().context(EncodeMetaSnafu)?);
            image.extend_from_slice(&compressed);
            tail_meta = Some(meta);
        }

        let index = self.build_index(tail_meta.as_ref());
        let index_offset = image.len() as u64;
        let index_bytes = index.encode().context(EncodeIndexSnafu)?;
        image.extend_from_slice(&index_bytes);
        image.extend_from_slice(
            &FileFooter {
                index_offset,
                index_len: index_bytes.len() as u64,
            }
            .encode(),
        );
        Ok(image)
    }
}

/// Salvages a temporary file left behind by a crash.
///
/// Sealed blocks are kept; the unsealed tail is discarded. The rebuilt file
/// is renamed into place, or the temporary is deleted outright when nothing
/// was salvageable.
pub async fn recover_partial(tmp_path: &Path) -> Result<Option<PathBuf>, WriterError> {
    let bytes = tokio::fs::read(tmp_path)
        .await
        .context(IoSnafu { path: tmp_path.to_path_buf() })?;

    let salvage = match salvage_blocks(&bytes) {
        Some(salvage) => salvage,
        None => {
            warn!(message = "discarding unsalvageable partial file", path = %tmp_path.display());
            tokio::fs::remove_file(tmp_path)
                .await
                .context(IoSnafu { path: tmp_path.to_path_buf() })?;
            return Ok(None);
        }
    };

    let file_name = tmp_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .trim_start_matches('.')
        .trim_end_matches(".tmp")
        .to_string();
    let final_path = tmp_path.with_file_name(&file_name);

    let mut image = bytes[..salvage.end_offset].to_vec();
    let index_offset = image.len() as u64;
    let index_bytes = salvage.index.encode().context(EncodeIndexSnafu)?;
    image.extend_from_slice(&index_bytes);
    image.extend_from_slice(
        &FileFooter {
            index_offset,
            index_len: index_bytes.len() as u64,
        }
        .encode(),
    );

    tokio::fs::write(&final_path, &image)
        .await
        .context(IoSnafu { path: final_path.clone() })?;
    tokio::fs::remove_file(tmp_path)
        .await
        .context(IoSnafu { path: tmp_path.to_path_buf() })?;

    info!(
        message = "recovered partial block file",
        path = %final_path.display(),
        blocks = salvage.index.blocks.len(),
        events = salvage.index.stats.event_count,
    );
    Ok(Some(final_path))
}

struct Salvage {
    end_offset: usize,
    index: FileIndex,
}

fn salvage_blocks(bytes: &[u8]) -> Option<Salvage> {
    if FileHeader::decode(bytes).is_err() {
        return None;
    }

    let mut pos = HEADER_LEN;
    let mut index = FileIndex::default();
    index.stats.min_timestamp = i64::MAX;
    index.stats.max_timestamp = i64::MIN;

    loop {
        let Some(block) = read_sealed_block(bytes, pos) else {
            break;
        };
        let (meta, events, next) = block;
        for event in &events {
            index.stats.event_count += 1;
            index.stats.min_timestamp = index.stats.min_timestamp.min(event.timestamp);
            index.stats.max_timestamp = index.stats.max_timestamp.max(event.timestamp);
            *index
                .stats
                .kinds
                .entry(event.identity.kind.clone())
                .or_insert(0) += 1;
            if let Some(ns) = &event.identity.namespace {
                *index.stats.namespaces.entry(ns.clone()).or_insert(0) += 1;
            }
            index.final_states.insert(
                event.identity.uid.clone(),
                FinalState {
                    kind: event.identity.kind.clone(),
                    namespace: event.identity.namespace.clone(),
                    name: event.identity.name.clone(),
                    event_kind: event.kind,
                    status: event.status,
                    timestamp: event.timestamp,
                },
            );
        }
        index.blocks.push(meta);
        pos = next;
    }

    if index.blocks.is_empty() {
        return None;
    }
    Some(Salvage {
        end_offset: pos,
        index,
    })
}

/// Reads one sealed block (metadata prefix plus verified payload) starting at
/// `pos`. Returns the metadata, decoded events, and the offset just past the
/// payload, or `None` when the bytes are truncated or corrupt.
fn read_sealed_block(bytes: &[u8], pos: usize) -> Option<(BlockMeta, Vec<Event>, usize)> {
    if pos + 4 > bytes.len() {
        return None;
    }
    let meta_len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().ok()?) as usize;
    let meta_start = pos + 4;
    let meta_end = meta_start + meta_len;
    if meta_end > bytes.len() {
        return None;
    }
    let meta: BlockMeta = serde_json::from_slice(&bytes[meta_start..meta_end]).ok()?;
    let payload_end = meta_end + meta.compressed_len as usize;
    if payload_end > bytes.len() {
        return None;
    }
    let payload = &bytes[meta_end..payload_end];

    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != meta.checksum {
        return None;
    }

    let events = reader::decode_block_payload(payload).ok()?;
    Some((meta, events, payload_end))
}
