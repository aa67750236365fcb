//! Export of raw block files and import of event envelopes.

use std::io::Write;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::{BlockStore, BlockStoreError};
use crate::event::Event;

#[derive(Debug, Snafu)]
pub enum ExportError {
    #[snafu(display("failed to enumerate files: {}", source))]
    List { source: BlockStoreError },

    #[snafu(display("failed to read block file: {}", source))]
    ReadFile { source: std::io::Error },

    #[snafu(display("failed to assemble archive: {}", source))]
    Archive { source: std::io::Error },

    #[snafu(display("failed to flush open hour: {}", source))]
    OpenHour { source: BlockStoreError },
}

/// Builds a tar archive (optionally gzipped) of the sealed hour files in the
/// range, plus a snapshot of the open hour when requested.
pub async fn build_archive(
    store: &BlockStore,
    from_ns: i64,
    to_ns: i64,
    include_open_hour: bool,
    gzip: bool,
) -> Result<Vec<u8>, ExportError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mtime = Utc::now().timestamp().max(0) as u64;
    let mut appended = 0usize;

    for path in store
        .sealed_files(from_ns, to_ns)
        .await
        .context(ListSnafu)?
    {
        let bytes = tokio::fs::read(&path).await.context(ReadFileSnafu)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        append_entry(&mut builder, &name, &bytes, mtime).context(ArchiveSnafu)?;
        appended += 1;
    }

    if include_open_hour {
        if let Some((partition, image)) = store.open_hour_snapshot().await.context(OpenHourSnafu)? {
            append_entry(&mut builder, &partition, &image, mtime).context(ArchiveSnafu)?;
            appended += 1;
        }
    }

    let tar_bytes = builder.into_inner().context(ArchiveSnafu)?;
    info!(message = "export archive assembled", files = appended, gzip);

    if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).context(ArchiveSnafu)?;
        encoder.finish().context(ArchiveSnafu)
    } else {
        Ok(tar_bytes)
    }
}

fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    bytes: &[u8],
    mtime: u64,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}

/// The import request body.
#[derive(Debug, Deserialize)]
pub struct ImportEnvelope {
    pub events: Vec<serde_json::Value>,
}

/// Outcome of an import: partial failures are reported, not fatal.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ImportReport {
    pub processed: usize,
    pub imported: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Ingests an import envelope. Kubernetes `Event` resources get their
/// `involvedObject.uid` lifted into the identity so relationships attach to
/// the object the event is about.
pub async fn import_events(store: &BlockStore, envelope: ImportEnvelope) -> ImportReport {
    let mut report = ImportReport::default();

    for value in envelope.events {
        report.processed += 1;
        let mut event: Event = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(error) => {
                report.failed += 1;
                report.errors.push(format!("malformed event: {error}"));
                continue;
            }
        };

        if event.identity.kind == "Event" && event.identity.involved_object_uid.is_none() {
            if let Some(uid) = event
                .payload
                .pointer("/involvedObject/uid")
                .and_then(|v| v.as_str())
            {
                event.identity.involved_object_uid = Some(uid.to_string());
            }
        }

        match store.append(event).await {
            Ok(()) => report.imported += 1,
            Err(error) => {
                report.failed += 1;
                report.errors.push(error.to_string());
            }
        }
    }

    info!(
        message = "import finished",
        processed = report.processed,
        imported = report.imported,
        failed = report.failed,
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_decodes() {
        let envelope: ImportEnvelope =
            serde_json::from_str(r#"{"events": [{"a": 1}, {"b": 2}]}"#).unwrap();
        assert_eq!(envelope.events.len(), 2);
    }
}
