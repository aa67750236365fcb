//! Random-access reader for sealed block files.

use std::io::Read;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use flate2::read::GzDecoder;
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use super::format::{BlockMeta, FileFooter, FileHeader, FileIndex, FormatError, FOOTER_LEN, HEADER_LEN};
use crate::event::Event;

#[derive(Debug, Snafu)]
pub enum ReaderError {
    #[snafu(display("read I/O error on {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("malformed block file {}: {}", path.display(), source))]
    Format { path: PathBuf, source: FormatError },

    #[snafu(display(
        "block checksum mismatch in {} at offset {}: calculated {:#x}, stored {:#x}",
        path.display(), offset, calculated, stored
    ))]
    ChecksumMismatch {
        path: PathBuf,
        offset: u64,
        calculated: u32,
        stored: u32,
    },

    #[snafu(display("failed to decompress block at offset {}: {}", offset, source))]
    Decompress {
        offset: u64,
        source: std::io::Error,
    },

    #[snafu(display("failed to decode event JSON in block at offset {}: {}", offset, source))]
    DecodeEvent {
        offset: u64,
        source: serde_json::Error,
    },
}

/// Decodes a gzip-compressed NDJSON block payload into events.
pub fn decode_block_payload(payload: &[u8]) -> Result<Vec<Event>, std::io::Error> {
    let mut decoder = GzDecoder::new(payload);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;

    let mut events = Vec::new();
    for line in raw.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_slice(line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        events.push(event);
    }
    Ok(events)
}

/// An opened, index-validated block file.
pub struct BlockFileReader {
    path: PathBuf,
    file: File,
    header: FileHeader,
    index: FileIndex,
}

impl BlockFileReader {
    /// Opens a sealed file, validating header magic and version and loading
    /// the trailing index. A version mismatch refuses the file with a
    /// structured error.
    pub async fn open(path: &Path) -> Result<Self, ReaderError> {
        let mut file = File::open(path)
            .await
            .context(IoSnafu { path: path.to_path_buf() })?;

        let mut header_buf = [0u8; HEADER_LEN];
        file.read_exact(&mut header_buf)
            .await
            .context(IoSnafu { path: path.to_path_buf() })?;
        let header = FileHeader::decode(&header_buf)
            .context(FormatSnafu { path: path.to_path_buf() })?;

        let len = file
            .metadata()
            .await
            .context(IoSnafu { path: path.to_path_buf() })?
            .len();
        if len < (HEADER_LEN + FOOTER_LEN) as u64 {
            return Err(ReaderError::Format {
                path: path.to_path_buf(),
                source: FormatError::Truncated { section: "footer" },
            });
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))
            .await
            .context(IoSnafu { path: path.to_path_buf() })?;
        let mut footer_buf = [0u8; FOOTER_LEN];
        file.read_exact(&mut footer_buf)
            .await
            .context(IoSnafu { path: path.to_path_buf() })?;
        let footer = FileFooter::decode(&footer_buf)
            .context(FormatSnafu { path: path.to_path_buf() })?;

        file.seek(SeekFrom::Start(footer.index_offset))
            .await
            .context(IoSnafu { path: path.to_path_buf() })?;
        let mut index_buf = vec![0u8; footer.index_len as usize];
        file.read_exact(&mut index_buf)
            .await
            .context(IoSnafu { path: path.to_path_buf() })?;
        let index = FileIndex::decode(&index_buf)
            .context(FormatSnafu { path: path.to_path_buf() })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    /// Reads and decodes one block, verifying its checksum when the file was
    /// written with checksums enabled.
    pub async fn read_block(&mut self, meta: &BlockMeta) -> Result<Vec<Event>, ReaderError> {
        self.file
            .seek(SeekFrom::Start(meta.offset))
            .await
            .context(IoSnafu { path: self.path.clone() })?;
        let mut payload = vec![0u8; meta.compressed_len as usize];
        self.file
            .read_exact(&mut payload)
            .await
            .context(IoSnafu { path: self.path.clone() })?;

        if self.header.checksums {
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let calculated = hasher.finalize();
            if calculated != meta.checksum {
                return Err(ReaderError::ChecksumMismatch {
                    path: self.path.clone(),
                    offset: meta.offset,
                    calculated,
                    stored: meta.checksum,
                });
            }
        }

        decode_block_payload(&payload).map_err(|source| ReaderError::Decompress {
            offset: meta.offset,
            source,
        })
    }
}
