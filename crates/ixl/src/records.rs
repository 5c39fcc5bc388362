//! 📂 Records: the upstream feed, one NDJSON line at a time.
//!
//! Every line is one write:
//!
//! ```text
//! {"id": "A", "doc": {"title": "Dune"}}
//! {"id": "B", "op": "update", "doc": {"year": 1965}}
//! {"id": "C", "op": "delete"}
//! ```
//!
//! `op` defaults to `index`. `doc` is carried as raw JSON text; we never build a tree for it,
//! it goes to the bulk body exactly as it came in. Blank lines are skipped. End of file is the
//! end of the run. 🦆

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::trace;

use crate::common::OpKind;
use crate::progress::ProgressMetrics;

/// 📄 One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub op: OpKind,
    pub id: String,
    /// 📦 raw JSON, `None` for deletes
    pub doc: Option<String>,
}

#[derive(Deserialize)]
struct WireRecord<'a> {
    #[serde(borrow)]
    id: Cow<'a, str>,
    #[serde(default)]
    op: OpKind,
    #[serde(borrow, default)]
    doc: Option<&'a RawValue>,
}

/// 🔍 Parse one line. The document body is borrowed from the line and copied once.
pub fn parse_record(line: &str) -> Result<Record> {
    let the_wire: WireRecord<'_> = serde_json::from_str(line).context("💀 record is not a valid JSON object")?;
    if the_wire.id.is_empty() {
        bail!("💀 record has an empty 'id'");
    }
    let doc = match (the_wire.op, the_wire.doc) {
        (OpKind::Delete, _) => None,
        (_, Some(raw)) => Some(raw.get().to_string()),
        (op, None) => bail!("💀 '{}' record '{}' has no 'doc'", op.as_str(), the_wire.id),
    };
    Ok(Record {
        op: the_wire.op,
        id: the_wire.id.into_owned(),
        doc,
    })
}

/// 📂 Streams [`Record`]s out of an NDJSON file.
pub struct RecordSource {
    path: PathBuf,
    reader: BufReader<File>,
    line: String,
    line_number: u64,
    progress: Option<ProgressMetrics>,
}

impl std::fmt::Debug for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSource")
            .field("path", &self.path)
            .field("line_number", &self.line_number)
            .finish()
    }
}

impl RecordSource {
    /// 🚪 Open the file. `show_progress` puts a progress bar on the terminal.
    pub async fn open(path: &Path, show_progress: bool) -> Result<Self> {
        let file = File::open(path).await.with_context(|| {
            format!(
                "💀 could not open record file '{}'. Check the path, the permissions, and whether it exists at all.",
                path.display()
            )
        })?;
        // -- 📏 unknown size just means no percentage on the bar
        let file_size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        let progress = show_progress.then(|| ProgressMetrics::new(path.display().to_string(), file_size));

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: String::new(),
            line_number: 0,
            progress,
        })
    }

    /// 🔄 The next record, or `None` at end of file.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            self.line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut self.line)
                .await
                .with_context(|| format!("💀 reading '{}' failed after line {}", self.path.display(), self.line_number))?;
            if bytes_read == 0 {
                if let Some(progress) = &self.progress {
                    progress.finish();
                }
                return Ok(None);
            }
            self.line_number += 1;

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                if let Some(progress) = &mut self.progress {
                    progress.update(bytes_read as u64, 0);
                }
                continue;
            }

            let record = parse_record(trimmed)
                .with_context(|| format!("💀 bad record at {}:{}", self.path.display(), self.line_number))?;
            trace!("📖 line {} → {} '{}'", self.line_number, record.op.as_str(), record.id);
            if let Some(progress) = &mut self.progress {
                progress.update(bytes_read as u64, 1);
            }
            return Ok(Some(record));
        }
    }
}
