//! Vector memory export and import.
//!
//! Records are written as JSON Lines, one [`EmbeddingRecord`] per line,
//! oldest first, superseded records included. Importing the file into
//! another store restores every record with its original id, vector and
//! metadata; ids already present are skipped, so re-importing the same
//! file is a no-op.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use excuse_harness_core::memory::{EmbeddingRecord, MemoryFilter, VectorMemory};

/// Outcome of an import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: usize,
    pub skipped: usize,
}

/// Write every record to `out`. Returns the record count.
pub async fn write_records<W: Write>(memory: &dyn VectorMemory, out: W) -> Result<usize> {
    let records = memory
        .records(&MemoryFilter::default().with_superseded())
        .await?;
    let mut out = BufWriter::new(out);
    for record in &records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(records.len())
}

/// Restore records read from `input`. Blank lines are ignored.
pub async fn read_records<R: BufRead>(memory: &dyn VectorMemory, input: R) -> Result<ImportStats> {
    let mut stats = ImportStats::default();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EmbeddingRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid memory record on line {}", idx + 1))?;
        if memory.restore(record).await? {
            stats.imported += 1;
        } else {
            stats.skipped += 1;
        }
    }
    Ok(stats)
}

pub async fn export_to_file(memory: &dyn VectorMemory, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create export file: {}", path.display()))?;
    let count = write_records(memory, file).await?;
    tracing::info!(records = count, path = %path.display(), "memory exported");
    Ok(count)
}

pub async fn import_from_file(memory: &dyn VectorMemory, path: &Path) -> Result<ImportStats> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open import file: {}", path.display()))?;
    let stats = read_records(memory, BufReader::new(file)).await?;
    tracing::info!(
        imported = stats.imported,
        skipped = stats.skipped,
        path = %path.display(),
        "memory imported"
    );
    Ok(stats)
}
