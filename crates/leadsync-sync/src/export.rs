//! Parquet snapshot of the lead store with a checksummed manifest.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use leadsync_core::{LeadField, LeadRecord};
use leadsync_storage::LeadStore;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

pub const LEADS_FILE: &str = "leads.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub records: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `leads.parquet` and `manifest.json` into `out_dir`; returns the manifest path.
pub async fn export_leads(store: &dyn LeadStore, out_dir: &Path) -> Result<PathBuf> {
    let records = store.export_leads().await.context("loading leads for export")?;
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let count = records.len();
    let leads_path = out_dir.join(LEADS_FILE);
    let leads_file = tokio::task::spawn_blocking(move || write_leads_file(&leads_path, &records))
        .await
        .context("parquet writer task panicked")??;

    let manifest = ExportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        records: count,
        files: vec![leads_file],
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(records = count, dir = %out_dir.display(), "exported leads");
    Ok(manifest_path)
}

fn leads_batch(records: &[LeadRecord]) -> Result<RecordBatch> {
    let mut fields = vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("versionNumber", DataType::UInt32, false),
        ArrowField::new("isDuplicateVersion", DataType::Boolean, false),
        ArrowField::new("importedAt", DataType::Utf8, false),
        ArrowField::new("createdAt", DataType::Utf8, false),
        ArrowField::new("lastUpdatedAt", DataType::Utf8, false),
    ];
    fields.extend(
        LeadField::ALL
            .iter()
            .map(|f| ArrowField::new(f.key(), DataType::Utf8, false)),
    );
    let schema = Arc::new(Schema::new(fields));

    let timestamps = |get: fn(&LeadRecord) -> DateTime<Utc>| -> ArrayRef {
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| get(r).to_rfc3339())
                .collect::<Vec<_>>(),
        ))
    };

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records.iter().map(|r| r.id.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            records.iter().map(|r| r.version_number).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            records
                .iter()
                .map(|r| r.is_duplicate_version)
                .collect::<Vec<_>>(),
        )),
        timestamps(|r| r.imported_at),
        timestamps(|r| r.created_at),
        timestamps(|r| r.last_updated_at),
    ];
    for field in LeadField::ALL {
        columns.push(Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.fields.get(*field))
                .collect::<Vec<_>>(),
        )));
    }

    RecordBatch::try_new(schema, columns).context("building leads record batch")
}

/// Hashes and counts everything written through it.
struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(mut self) -> io::Result<(String, u64)> {
        self.inner.flush()?;
        Ok((hex::encode(self.hasher.finalize()), self.bytes))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write the leads parquet file and describe it for the manifest.
fn write_leads_file(path: &Path, records: &[LeadRecord]) -> Result<ExportManifestFile> {
    let batch = leads_batch(records)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(DigestWriter::new(file), batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing leads to {}", path.display()))?;
    let (sha256, bytes) = writer
        .into_inner()
        .with_context(|| format!("finishing {}", path.display()))?
        .finish()
        .with_context(|| format!("flushing {}", path.display()))?;

    Ok(ExportManifestFile {
        name: "leads".to_string(),
        path: LEADS_FILE.to_string(),
        sha256,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsync_core::LeadFields;
    use leadsync_storage::{LeadWrite, MemoryLeadStore};
    use tempfile::tempdir;

    #[tokio::test]
    async fn export_writes_parquet_and_matching_manifest() {
        let store = MemoryLeadStore::new();
        let now = Utc::now();
        store
            .write_chunk(&[
                LeadWrite::Insert(LeadRecord::new_version(LeadFields::with_proposal_number("P-1"), 1, now)),
                LeadWrite::Insert(LeadRecord::new_version(LeadFields::with_proposal_number("P-1"), 2, now)),
            ])
            .await
            .unwrap();

        let dir = tempdir().unwrap();
        let manifest_path = export_leads(&store, dir.path()).await.unwrap();

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["records"], 2);
        let entry = &manifest["files"][0];
        assert_eq!(entry["path"], LEADS_FILE);

        let parquet_bytes = std::fs::read(dir.path().join(LEADS_FILE)).unwrap();
        assert_eq!(entry["bytes"], parquet_bytes.len() as u64);
        assert_eq!(entry["sha256"], leadsync_storage::StagingArea::sha256_hex(&parquet_bytes));
        assert_eq!(&parquet_bytes[..4], b"PAR1");
    }

    #[test]
    fn digest_writer_matches_a_hash_of_the_output() {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"PAR1").unwrap();
        writer.write_all(b"rows").unwrap();
        let (sha256, bytes) = writer.finish().unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(sha256, leadsync_storage::StagingArea::sha256_hex(b"PAR1rows"));
    }

    #[test]
    fn batch_has_bookkeeping_and_every_canonical_column() {
        let record = LeadRecord::new_version(LeadFields::with_proposal_number("P-1"), 1, Utc::now());
        let batch = leads_batch(&[record]).unwrap();
        assert_eq!(batch.num_columns(), 6 + LeadField::ALL.len());
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.schema().field_with_name("proposalNumber").is_ok());
    }
}
