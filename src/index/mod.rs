//! C4 Embedding Index (spec.md §4.4, §6): a persistent map from
//! work-item-id to unit vector + metadata, supporting upsert, clear, exact
//! inner-product search.
//!
//! Persistence follows the external contract in spec.md §6 exactly: two
//! sibling files (`vectors.bin`, `metadata.json`) written via
//! write-then-rename, with at most one valid pair in the directory at any
//! time. Concurrency discipline (shared lock for readers, exclusive lock for
//! writers) uses `fs2`, the same crate the example pack already relies on
//! for cross-process advisory file locks (`danielmriley-aigent`).
//!
//! Per spec.md §9 Design Notes: "FAISS index (flat inner-product) -> a
//! straightforward dense matrix of unit vectors with brute-force argmax-K.
//! Typical candidate counts are < 2,000 per request, so this is O(N*D) per
//! search and needs no specialized library." This module is exactly that: a
//! `Vec<IndexRecord>` searched by linear scan, no ANN structure.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::domain::{Embedding, EmbeddingSourceInfo, IndexRecord, WorkItem};
use crate::error::{RelatednessError, Result};

const VECTORS_MAGIC: &[u8; 8] = b"RELCOREV";
const VECTORS_VERSION: u32 = 1;

/// One entry submitted to `upsert` (spec.md §4.4 "Operations").
pub struct UpsertCandidate {
    pub work_item: WorkItem,
    pub vector: Vec<f32>,
    pub ok: bool,
    pub source: EmbeddingSourceInfo,
}

#[derive(Debug, Default, Clone)]
pub struct UpsertReport {
    pub inserted: usize,
    pub replaced: usize,
    pub dropped_not_ok: usize,
    pub dropped_invalid_vector: usize,
    pub dropped_dimension_mismatch: usize,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub count: usize,
    pub dimension: Option<usize>,
    pub approx_bytes: usize,
}

#[derive(Serialize, Deserialize)]
struct RecordMeta {
    work_item: WorkItem,
    embedding_source: EmbeddingSourceInfo,
    inserted_at: chrono::DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct MetadataFile {
    dimension: usize,
    work_item_ids: Vec<i64>,
    records: HashMap<String, RecordMeta>,
    last_updated: chrono::DateTime<Utc>,
}

pub struct EmbeddingIndex {
    dir: PathBuf,
    dimension: Option<usize>,
    ids: Vec<i64>,
    records: Vec<IndexRecord>,
    id_pos: HashMap<i64, usize>,
}

impl EmbeddingIndex {
    /// Open (loading any existing persisted state) or create an empty index
    /// rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| RelatednessError::internal(format!("creating index dir: {e}")))?;

        let vectors_path = dir.join("vectors.bin");
        let metadata_path = dir.join("metadata.json");

        if !vectors_path.exists() || !metadata_path.exists() {
            return Ok(Self {
                dir,
                dimension: None,
                ids: Vec::new(),
                records: Vec::new(),
                id_pos: HashMap::new(),
            });
        }

        let meta_file = File::open(&metadata_path)
            .map_err(|e| RelatednessError::index_corrupt(metadata_path.display().to_string(), e.to_string()))?;
        meta_file
            .lock_shared()
            .map_err(|e| RelatednessError::internal(format!("locking metadata.json: {e}")))?;
        let metadata: MetadataFile = serde_json::from_reader(BufReader::new(&meta_file))
            .map_err(|e| RelatednessError::index_corrupt(metadata_path.display().to_string(), e.to_string()))?;
        meta_file.unlock().ok();

        let vec_file = File::open(&vectors_path)
            .map_err(|e| RelatednessError::index_corrupt(vectors_path.display().to_string(), e.to_string()))?;
        vec_file
            .lock_shared()
            .map_err(|e| RelatednessError::internal(format!("locking vectors.bin: {e}")))?;
        let (dimension, flat) = read_vectors(&vec_file, &vectors_path)?;
        vec_file.unlock().ok();

        if dimension != metadata.dimension {
            return Err(RelatednessError::index_corrupt(
                dir.display().to_string(),
                format!(
                    "vectors.bin dimension ({dimension}) does not match metadata.json dimension ({})",
                    metadata.dimension
                ),
            ));
        }
        let expected_floats = metadata.work_item_ids.len() * dimension;
        if flat.len() != expected_floats {
            return Err(RelatednessError::index_corrupt(
                dir.display().to_string(),
                format!(
                    "vectors.bin holds {} floats, expected {} for {} ids at dimension {}",
                    flat.len(),
                    expected_floats,
                    metadata.work_item_ids.len(),
                    dimension
                ),
            ));
        }

        let mut ids = Vec::with_capacity(metadata.work_item_ids.len());
        let mut records = Vec::with_capacity(metadata.work_item_ids.len());
        let mut id_pos = HashMap::with_capacity(metadata.work_item_ids.len());

        for (i, id) in metadata.work_item_ids.iter().enumerate() {
            let meta = metadata.records.get(&id.to_string()).ok_or_else(|| {
                RelatednessError::index_corrupt(
                    dir.display().to_string(),
                    format!("metadata.json missing record entry for id {id}"),
                )
            })?;
            let start = i * dimension;
            let vector = flat[start..start + dimension].to_vec();
            ids.push(*id);
            id_pos.insert(*id, records.len());
            records.push(IndexRecord {
                work_item_id: *id,
                embedding: Embedding::from_unit_vector(vector),
                work_item_snapshot: meta.work_item.clone(),
                embedding_source_info: meta.embedding_source.clone(),
                inserted_at: meta.inserted_at,
            });
        }

        Ok(Self {
            dir,
            dimension: Some(dimension),
            ids,
            records,
            id_pos,
        })
    }

    /// `upsert(items, embeddings)` (spec.md §4.4). Requires `ok=true` and a
    /// non-empty vector per entry; L2-normalizes defensively; last-write-wins
    /// on id collision; persists the result atomically.
    pub fn upsert(&mut self, entries: Vec<UpsertCandidate>) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();

        for entry in entries {
            if !entry.ok || entry.vector.is_empty() {
                report.dropped_not_ok += 1;
                continue;
            }

            let embedding = match Embedding::normalized(entry.vector) {
                Some(e) => e,
                None => {
                    report.dropped_invalid_vector += 1;
                    continue;
                }
            };

            match self.dimension {
                None => self.dimension = Some(embedding.dimension()),
                Some(d) if d != embedding.dimension() => {
                    report.dropped_dimension_mismatch += 1;
                    continue;
                }
                _ => {}
            }

            let record = IndexRecord {
                work_item_id: entry.work_item.id,
                embedding,
                work_item_snapshot: entry.work_item.clone(),
                embedding_source_info: entry.source,
                inserted_at: Utc::now(),
            };

            if let Some(&pos) = self.id_pos.get(&entry.work_item.id) {
                self.records[pos] = record;
                report.replaced += 1;
            } else {
                self.id_pos.insert(entry.work_item.id, self.records.len());
                self.ids.push(entry.work_item.id);
                self.records.push(record);
                report.inserted += 1;
            }
        }

        self.persist()?;
        Ok(report)
    }

    /// `search(query_vector, k)` (spec.md §4.4): top-k `(id, inner_product)`
    /// pairs sorted descending, brute-force over the in-memory record set.
    pub fn search(&self, query: &Embedding, k: usize, exclude_ids: &[i64]) -> Vec<(i64, f32)> {
        let mut scored: Vec<(i64, f32)> = self
            .records
            .iter()
            .filter(|r| !exclude_ids.contains(&r.work_item_id))
            .map(|r| (r.work_item_id, query.inner_product(&r.embedding)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn get(&self, id: i64) -> Option<&IndexRecord> {
        self.id_pos.get(&id).map(|&pos| &self.records[pos])
    }

    pub fn exists(&self, id: i64) -> bool {
        self.id_pos.contains_key(&id)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.dimension = None;
        self.ids.clear();
        self.records.clear();
        self.id_pos.clear();
        self.persist()
    }

    /// Reset the index persisted at `dir` to empty, without requiring a
    /// successful prior `open`. This is the recovery path for
    /// `IndexCorrupt` (spec.md §7: "recoverable by clearing"): `open`
    /// returns before a `Self` exists once the on-disk pair fails
    /// validation, so `clear` (which needs `&mut self`) is unreachable on a
    /// corrupt store. `clear_at` writes a fresh empty pair directly,
    /// overwriting whatever is there.
    pub fn clear_at(dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| RelatednessError::internal(format!("creating index dir: {e}")))?;

        let empty = Self {
            dir,
            dimension: None,
            ids: Vec::new(),
            records: Vec::new(),
            id_pos: HashMap::new(),
        };
        empty.persist()
    }

    pub fn stats(&self) -> IndexStats {
        let dimension = self.dimension.unwrap_or(0);
        IndexStats {
            count: self.records.len(),
            dimension: self.dimension,
            approx_bytes: self.records.len() * dimension * std::mem::size_of::<f32>(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write `vectors.bin` and `metadata.json` atomically: both are written
    /// to `.tmp` siblings and `fsync`'d in full before either is renamed
    /// into place, so a crash at any point before both tmp writes finish
    /// leaves the previous committed pair untouched (spec.md §8 Scenario
    /// F). `vectors.bin` is renamed first and `metadata.json` last, so
    /// metadata's presence is the commit signal; a crash between the two
    /// renames is caught on next `open` as a dimension/count mismatch and
    /// surfaces `IndexCorrupt`, which is recoverable via `clear_at`
    /// (spec.md §7) since `open` having already failed rules out `clear`.
    fn persist(&self) -> Result<()> {
        let dimension = self.dimension.unwrap_or(0);

        let vectors_tmp = self.dir.join("vectors.bin.tmp");
        let metadata_tmp = self.dir.join("metadata.json.tmp");
        let vectors_path = self.dir.join("vectors.bin");
        let metadata_path = self.dir.join("metadata.json");

        write_vectors(&vectors_tmp, dimension, &self.records)?;

        let records_map: HashMap<String, RecordMeta> = self
            .records
            .iter()
            .map(|r| {
                (
                    r.work_item_id.to_string(),
                    RecordMeta {
                        work_item: r.work_item_snapshot.clone(),
                        embedding_source: r.embedding_source_info.clone(),
                        inserted_at: r.inserted_at,
                    },
                )
            })
            .collect();
        let metadata = MetadataFile {
            dimension,
            work_item_ids: self.ids.clone(),
            records: records_map,
            last_updated: Utc::now(),
        };
        write_metadata(&metadata_tmp, &metadata)?;

        let lock_file = File::create(self.dir.join(".lock"))
            .map_err(|e| RelatednessError::internal(format!("creating lock file: {e}")))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| RelatednessError::internal(format!("acquiring exclusive lock: {e}")))?;

        fs::rename(&vectors_tmp, &vectors_path)
            .map_err(|e| RelatednessError::internal(format!("renaming vectors.bin: {e}")))?;
        fs::rename(&metadata_tmp, &metadata_path)
            .map_err(|e| RelatednessError::internal(format!("renaming metadata.json: {e}")))?;

        lock_file.unlock().ok();

        tracing::info!(
            dir = %self.dir.display(),
            count = self.records.len(),
            dimension,
            "index persisted"
        );
        Ok(())
    }
}

fn write_vectors(path: &Path, dimension: usize, records: &[IndexRecord]) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| RelatednessError::internal(format!("creating {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);

    writer
        .write_all(VECTORS_MAGIC)
        .and_then(|_| writer.write_all(&VECTORS_VERSION.to_le_bytes()))
        .and_then(|_| writer.write_all(&(dimension as u64).to_le_bytes()))
        .and_then(|_| writer.write_all(&(records.len() as u64).to_le_bytes()))
        .map_err(|e| RelatednessError::internal(format!("writing vectors header: {e}")))?;

    for record in records {
        for v in &record.embedding.values {
            writer
                .write_all(&v.to_le_bytes())
                .map_err(|e| RelatednessError::internal(format!("writing vector data: {e}")))?;
        }
    }
    writer
        .flush()
        .map_err(|e| RelatednessError::internal(format!("flushing vectors.bin.tmp: {e}")))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| RelatednessError::internal(format!("fsyncing vectors.bin.tmp: {e}")))?;
    Ok(())
}

fn read_vectors(file: &File, path: &Path) -> Result<(usize, Vec<f32>)> {
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|e| RelatednessError::index_corrupt(path.display().to_string(), e.to_string()))?;
    if &magic != VECTORS_MAGIC {
        return Err(RelatednessError::index_corrupt(
            path.display().to_string(),
            "bad magic bytes".to_string(),
        ));
    }

    let mut version_bytes = [0u8; 4];
    reader
        .read_exact(&mut version_bytes)
        .map_err(|e| RelatednessError::index_corrupt(path.display().to_string(), e.to_string()))?;
    if u32::from_le_bytes(version_bytes) != VECTORS_VERSION {
        return Err(RelatednessError::index_corrupt(
            path.display().to_string(),
            "unsupported vectors.bin version".to_string(),
        ));
    }

    let mut dim_bytes = [0u8; 8];
    reader
        .read_exact(&mut dim_bytes)
        .map_err(|e| RelatednessError::index_corrupt(path.display().to_string(), e.to_string()))?;
    let dimension = u64::from_le_bytes(dim_bytes) as usize;

    let mut count_bytes = [0u8; 8];
    reader
        .read_exact(&mut count_bytes)
        .map_err(|e| RelatednessError::index_corrupt(path.display().to_string(), e.to_string()))?;
    let count = u64::from_le_bytes(count_bytes) as usize;

    let mut flat = vec![0f32; count * dimension];
    for v in &mut flat {
        let mut bytes = [0u8; 4];
        reader
            .read_exact(&mut bytes)
            .map_err(|e| RelatednessError::index_corrupt(path.display().to_string(), e.to_string()))?;
        *v = f32::from_le_bytes(bytes);
    }

    Ok((dimension, flat))
}

fn write_metadata(path: &Path, metadata: &MetadataFile) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| RelatednessError::internal(format!("creating {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, metadata)
        .map_err(|e| RelatednessError::internal(format!("writing metadata.json.tmp: {e}")))?;
    writer
        .flush()
        .map_err(|e| RelatednessError::internal(format!("flushing metadata.json.tmp: {e}")))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| RelatednessError::internal(format!("fsyncing metadata.json.tmp: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn work_item(id: i64) -> WorkItem {
        WorkItem {
            id,
            title: format!("title {id}"),
            description: String::new(),
            acceptance_criteria: String::new(),
            repro_steps: String::new(),
            business_value: String::new(),
            work_item_type: "Bug".to_string(),
            state: "Active".to_string(),
            priority: Some(2),
            area_path: "Proj\\Team".to_string(),
            iteration_path: "Proj\\Sprint1".to_string(),
            tags: vec![],
            assigned_to: None,
            created_date: Utc::now(),
            changed_date: Utc::now(),
        }
    }

    fn source() -> EmbeddingSourceInfo {
        EmbeddingSourceInfo {
            source: crate::domain::EmbeddingSource::Provider,
            model: Some("test-model".to_string()),
            tokens: Some(10),
        }
    }

    #[test]
    fn upsert_then_search_roundtrip() {
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();

        let entries = vec![
            UpsertCandidate {
                work_item: work_item(1),
                vector: vec![1.0, 0.0, 0.0],
                ok: true,
                source: source(),
            },
            UpsertCandidate {
                work_item: work_item(2),
                vector: vec![0.0, 1.0, 0.0],
                ok: true,
                source: source(),
            },
        ];
        let report = index.upsert(entries).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(index.len(), 2);

        let query = Embedding::from_unit_vector(vec![1.0, 0.0, 0.0]);
        let results = index.search(&query, 5, &[]);
        assert_eq!(results[0].0, 1);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn upsert_is_idempotent_on_same_id() {
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();

        index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![1.0, 0.0],
                ok: true,
                source: source(),
            }])
            .unwrap();
        index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![1.0, 0.0],
                ok: true,
                source: source(),
            }])
            .unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.ids, vec![1]);
    }

    #[test]
    fn dimension_mismatch_is_dropped() {
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();
        index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![1.0, 0.0],
                ok: true,
                source: source(),
            }])
            .unwrap();
        let report = index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(2),
                vector: vec![1.0, 0.0, 0.0],
                ok: true,
                source: source(),
            }])
            .unwrap();
        assert_eq!(report.dropped_dimension_mismatch, 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn not_ok_entries_are_dropped() {
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();
        let report = index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![],
                ok: false,
                source: source(),
            }])
            .unwrap();
        assert_eq!(report.dropped_not_ok, 1);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn clear_empties_index_and_persists() {
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();
        index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![1.0, 0.0],
                ok: true,
                source: source(),
            }])
            .unwrap();
        index.clear().unwrap();
        assert!(index.is_empty());

        let reloaded = EmbeddingIndex::open(dir.path()).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn persists_and_reloads_byte_identical_modulo_last_updated() {
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();
        index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![0.6, 0.8],
                ok: true,
                source: source(),
            }])
            .unwrap();

        let reloaded = EmbeddingIndex::open(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        let rec = reloaded.get(1).unwrap();
        assert!(rec.embedding.is_unit());
        assert_eq!(rec.work_item_snapshot.id, 1);
    }

    #[test]
    fn crash_before_rename_leaves_previous_pair_loadable() {
        // Simulates spec.md Scenario F: write the initial valid pair, then
        // simulate a crash mid-write of the *next* generation by leaving
        // stray .tmp files in the directory without ever renaming them.
        // The previous committed pair must still load cleanly.
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();
        index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![1.0, 0.0],
                ok: true,
                source: source(),
            }])
            .unwrap();

        fs::write(dir.path().join("vectors.bin.tmp"), b"garbage").unwrap();

        let reloaded = EmbeddingIndex::open(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.exists(1));
    }

    #[test]
    fn corrupt_metadata_is_detected_and_clear_at_recovers() {
        let dir = tempdir().unwrap();
        let mut index = EmbeddingIndex::open(dir.path()).unwrap();
        index
            .upsert(vec![UpsertCandidate {
                work_item: work_item(1),
                vector: vec![1.0, 0.0],
                ok: true,
                source: source(),
            }])
            .unwrap();

        fs::write(dir.path().join("metadata.json"), b"not valid json").unwrap();

        let err = EmbeddingIndex::open(dir.path()).unwrap_err();
        assert!(matches!(err, RelatednessError::IndexCorrupt { .. }));

        EmbeddingIndex::clear_at(dir.path()).unwrap();

        let recovered = EmbeddingIndex::open(dir.path()).unwrap();
        assert!(recovered.is_empty());
    }
}
