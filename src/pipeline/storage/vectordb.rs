use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{Chunk, ChunkFilter, EmbeddingModel, ScoredChunk};
use super::StorageError;

const SNAPSHOT_VERSION: u32 = 1;

/// In-memory vector index over scrubbed chunks.
///
/// Writers are serialized behind a write lock. Embeddings are stored as
/// immutable shared slices, so a concurrent query always sees whole vectors.
pub struct VectorIndex<E: EmbeddingModel> {
    embedder: E,
    state: RwLock<IndexState>,
}

#[derive(Default)]
struct IndexState {
    chunks: Vec<Chunk>,
    embeddings: Vec<Arc<[f32]>>,
    corrupted: bool,
}

impl IndexState {
    fn check(&self) -> Result<(), StorageError> {
        if self.corrupted || self.chunks.len() != self.embeddings.len() {
            return Err(StorageError::IndexCorruption {
                chunks: self.chunks.len(),
                embeddings: self.embeddings.len(),
            });
        }
        Ok(())
    }

    fn remove_document(&mut self, document_id: &Uuid) -> usize {
        let before = self.chunks.len();
        let keep: Vec<bool> = self.chunks.iter().map(|c| c.document_id != *document_id).collect();
        let mut flags = keep.iter();
        self.chunks.retain(|_| *flags.next().unwrap_or(&true));
        let mut flags = keep.iter();
        self.embeddings.retain(|_| *flags.next().unwrap_or(&true));
        before - self.chunks.len()
    }
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    dimension: usize,
    chunks: Vec<Chunk>,
    embeddings: Vec<Vec<f32>>,
}

impl<E: EmbeddingModel> VectorIndex<E> {
    pub fn new(embedder: E) -> Self {
        Self {
            embedder,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// Embed and store `chunks`. All or nothing: on any failure the index
    /// is left unchanged (or flagged corrupted on a count mismatch).
    pub fn add(&self, chunks: &[Chunk]) -> Result<usize, StorageError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        self.commit(None, chunks).map(|_| chunks.len())
    }

    /// Swap every chunk of `document_id` for `chunks`. Embedding happens
    /// before the write lock is taken, so a failure keeps the old chunks.
    /// Returns the number of chunks removed.
    pub fn replace_document(&self, document_id: &Uuid, chunks: &[Chunk]) -> Result<usize, StorageError> {
        self.commit(Some(document_id), chunks)
    }

    fn commit(&self, replace: Option<&Uuid>, chunks: &[Chunk]) -> Result<usize, StorageError> {
        let embeddings = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
            self.embedder.embed_batch(&texts)?
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.check()?;

        if embeddings.len() != chunks.len() {
            state.corrupted = true;
            tracing::error!(
                chunks = chunks.len(),
                embeddings = embeddings.len(),
                "Embedding count mismatch; index flagged corrupted"
            );
            return Err(StorageError::IndexCorruption {
                chunks: chunks.len(),
                embeddings: embeddings.len(),
            });
        }
        let expected = self.embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != expected) {
            return Err(StorageError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        let removed = replace.map_or(0, |id| state.remove_document(id));
        state.chunks.extend_from_slice(chunks);
        state.embeddings.extend(embeddings.into_iter().map(Arc::from));
        tracing::debug!(added = chunks.len(), removed, total = state.chunks.len(), "Chunks indexed");
        Ok(removed)
    }

    /// Top-`k` chunks by cosine similarity to `text`. Ties are broken by
    /// chunk id, so identical state and query give identical ordering.
    pub fn query(&self, text: &str, k: usize, filter: Option<&ChunkFilter>) -> Result<Vec<ScoredChunk>, StorageError> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).check()?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text)?;

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.check()?;
        let mut scored: Vec<(usize, f32)> = state
            .chunks
            .iter()
            .zip(state.embeddings.iter())
            .enumerate()
            .filter(|(_, (chunk, _))| filter.map_or(true, |f| f.matches(chunk)))
            .map(|(i, (_, embedding))| (i, cosine_similarity(&query, embedding)))
            .collect();

        scored.sort_by(|(ia, sa), (ib, sb)| {
            sb.total_cmp(sa)
                .then_with(|| state.chunks[*ia].id.cmp(&state.chunks[*ib].id))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                chunk: state.chunks[i].clone(),
                score,
            })
            .collect())
    }

    pub fn delete_by_document(&self, document_id: &Uuid) -> Result<usize, StorageError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.check()?;
        Ok(state.remove_document(document_id))
    }

    pub fn count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).chunks.len()
    }

    pub fn count_for_document(&self, document_id: &Uuid) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .chunks
            .iter()
            .filter(|c| c.document_id == *document_id)
            .count()
    }

    pub fn is_corrupted(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).check().is_err()
    }

    /// Drop every chunk and clear the corruption flag.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = IndexState::default();
    }

    /// Write scrubbed chunks, embeddings and metadata to `path` as JSON.
    /// The file is written to a temporary sibling and renamed into place.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), StorageError> {
        let snapshot = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.check()?;
            IndexSnapshot {
                version: SNAPSHOT_VERSION,
                dimension: self.embedder.dimension(),
                chunks: state.chunks.clone(),
                embeddings: state.embeddings.iter().map(|e| e.to_vec()).collect(),
            }
        };

        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
        }
        tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
        tracing::info!(chunks = snapshot.chunks.len(), "Index snapshot saved");
        Ok(())
    }

    /// Replace the index contents with a snapshot.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize, StorageError> {
        let file = std::fs::File::open(path)?;
        let snapshot: IndexSnapshot = serde_json::from_reader(BufReader::new(file))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::Snapshot(format!("unsupported version {}", snapshot.version)));
        }
        let expected = self.embedder.dimension();
        if snapshot.dimension != expected {
            return Err(StorageError::DimensionMismatch {
                expected,
                actual: snapshot.dimension,
            });
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let loaded = IndexState {
            corrupted: snapshot.chunks.len() != snapshot.embeddings.len()
                || snapshot.embeddings.iter().any(|e| e.len() != expected),
            chunks: snapshot.chunks,
            embeddings: snapshot.embeddings.into_iter().map(Arc::from).collect(),
        };
        *state = loaded;
        state.check()?;
        tracing::info!(chunks = state.chunks.len(), "Index snapshot loaded");
        Ok(state.chunks.len())
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::storage::chunker::chunk;
    use crate::pipeline::storage::embedder::HashingEmbedder;

    fn index() -> VectorIndex<HashingEmbedder> {
        VectorIndex::new(HashingEmbedder::new())
    }

    fn make_chunks(doc: Uuid, label: &str, texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: Chunk::derive_id(&doc, i),
                document_id: doc,
                text: t.to_string(),
                start_offset: i * 100,
                end_offset: i * 100 + t.chars().count(),
                source_label: label.to_string(),
                order: i,
                overlap_with_previous: 0,
            })
            .collect()
    }

    /// Returns one embedding fewer than requested.
    struct ShortEmbedder;

    impl EmbeddingModel for ShortEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, StorageError> {
            Ok(vec![1.0; 4])
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StorageError> {
            Ok(vec![vec![1.0; 4]; texts.len().saturating_sub(1)])
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    struct FailingEmbedder;

    impl EmbeddingModel for FailingEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, StorageError> {
            Err(StorageError::Embedding("model offline".into()))
        }

        fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, StorageError> {
            Err(StorageError::Embedding("model offline".into()))
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    #[test]
    fn add_and_count() {
        let idx = index();
        let doc = Uuid::new_v4();
        let added = idx.add(&make_chunks(doc, "note", &["one", "two", "three"])).unwrap();
        assert_eq!(added, 3);
        assert_eq!(idx.count(), 3);
        assert_eq!(idx.count_for_document(&doc), 3);
    }

    #[test]
    fn query_ranks_relevant_chunk_first() {
        let idx = index();
        let doc = Uuid::new_v4();
        idx.add(&make_chunks(
            doc,
            "note",
            &[
                "Chest radiograph shows clear lung fields",
                "Discharge medications reviewed: metformin and lisinopril",
                "Physical therapy progress is steady",
            ],
        ))
        .unwrap();
        let results = idx.query("discharge medications", 3, None).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].chunk.text.starts_with("Discharge medications"));
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn query_is_deterministic_with_id_tie_break() {
        let idx = index();
        let doc = Uuid::new_v4();
        // Identical texts score identically; ordering falls to chunk id.
        idx.add(&make_chunks(doc, "note", &["same words here", "same words here", "same words here"]))
            .unwrap();
        let first = idx.query("same words", 3, None).unwrap();
        let second = idx.query("same words", 3, None).unwrap();
        let ids_a: Vec<Uuid> = first.iter().map(|s| s.chunk.id).collect();
        let ids_b: Vec<Uuid> = second.iter().map(|s| s.chunk.id).collect();
        assert_eq!(ids_a, ids_b);
        let mut sorted = ids_a.clone();
        sorted.sort();
        assert_eq!(ids_a, sorted);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let idx = index();
        idx.add(&make_chunks(Uuid::new_v4(), "note", &["a1", "b2", "c3"])).unwrap();
        assert_eq!(idx.query("anything", 5, None).unwrap().len(), 3);
        assert!(idx.query("anything", 0, None).unwrap().is_empty());
    }

    #[test]
    fn filter_restricts_results_without_rebuild() {
        let idx = index();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        idx.add(&make_chunks(doc1, "Admission note", &["fever on arrival"])).unwrap();
        idx.add(&make_chunks(doc2, "Discharge summary", &["fever resolved"])).unwrap();

        let only_doc2 = idx.query("fever", 5, Some(&ChunkFilter::for_document(doc2))).unwrap();
        assert_eq!(only_doc2.len(), 1);
        assert_eq!(only_doc2[0].chunk.document_id, doc2);

        let by_label = ChunkFilter {
            source_label_contains: Some("admission".into()),
            ..Default::default()
        };
        let results = idx.query("fever", 5, Some(&by_label)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.document_id, doc1);
    }

    #[test]
    fn delete_by_document_removes_only_matching() {
        let idx = index();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        idx.add(&make_chunks(doc1, "a", &["x1", "x2", "x3"])).unwrap();
        idx.add(&make_chunks(doc2, "b", &["y1", "y2"])).unwrap();

        assert_eq!(idx.delete_by_document(&doc1).unwrap(), 3);
        assert_eq!(idx.count(), 2);
        assert_eq!(idx.count_for_document(&doc1), 0);
        assert_eq!(idx.count_for_document(&doc2), 2);
        assert!(!idx.is_corrupted());
    }

    #[test]
    fn replace_document_swaps_only_that_document() {
        let idx = index();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();
        idx.add(&make_chunks(doc1, "a", &["x1", "x2", "x3"])).unwrap();
        idx.add(&make_chunks(doc2, "b", &["y1"])).unwrap();

        assert_eq!(idx.replace_document(&doc1, &make_chunks(doc1, "a", &["z1"])).unwrap(), 3);
        assert_eq!(idx.count_for_document(&doc1), 1);
        assert_eq!(idx.count_for_document(&doc2), 1);

        assert_eq!(idx.replace_document(&doc2, &[]).unwrap(), 1);
        assert_eq!(idx.count(), 1);
    }

    /// Embeds normally until switched off.
    struct SwitchableEmbedder {
        inner: HashingEmbedder,
        offline: std::sync::atomic::AtomicBool,
    }

    impl EmbeddingModel for SwitchableEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
            self.inner.embed(text)
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StorageError> {
            if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Embedding("model offline".into()));
            }
            self.inner.embed_batch(texts)
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    #[test]
    fn failed_replace_keeps_previous_chunks() {
        let idx = VectorIndex::new(SwitchableEmbedder {
            inner: HashingEmbedder::new(),
            offline: std::sync::atomic::AtomicBool::new(false),
        });
        let doc = Uuid::new_v4();
        idx.add(&make_chunks(doc, "a", &["x1", "x2"])).unwrap();

        idx.embedder().offline.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = idx.replace_document(&doc, &make_chunks(doc, "a", &["new"])).unwrap_err();
        assert!(matches!(err, StorageError::Embedding(_)));
        assert_eq!(idx.count_for_document(&doc), 2);
        assert!(!idx.is_corrupted());
    }

    #[test]
    fn failed_embedding_leaves_index_unchanged() {
        let idx = VectorIndex::new(FailingEmbedder);
        assert!(idx.add(&make_chunks(Uuid::new_v4(), "a", &["x1", "x2"])).is_err());
        assert_eq!(idx.count(), 0);
        assert!(!idx.is_corrupted());
    }

    #[test]
    fn count_mismatch_corrupts_until_cleared() {
        let idx = VectorIndex::new(ShortEmbedder);
        let err = idx.add(&make_chunks(Uuid::new_v4(), "a", &["x1", "x2"])).unwrap_err();
        assert!(matches!(err, StorageError::IndexCorruption { chunks: 2, embeddings: 1 }));
        assert!(idx.is_corrupted());
        assert!(matches!(idx.query("x", 3, None), Err(StorageError::IndexCorruption { .. })));
        assert!(matches!(
            idx.add(&make_chunks(Uuid::new_v4(), "a", &["x1"])),
            Err(StorageError::IndexCorruption { .. })
        ));

        idx.clear();
        assert!(!idx.is_corrupted());
        assert!(idx.query("x", 3, None).unwrap().is_empty());
    }

    #[test]
    fn concurrent_adds_are_serialized() {
        let idx = Arc::new(index());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let idx = Arc::clone(&idx);
                std::thread::spawn(move || {
                    let doc = Uuid::new_v4();
                    let text = "Progress note. ".repeat(40);
                    let chunks = chunk(&text, doc, "Progress note", 100, 20).unwrap();
                    let n = chunks.len();
                    idx.add(&chunks).unwrap();
                    let _ = idx.query("progress", 3, None).unwrap();
                    n
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(idx.count(), total);
        assert!(!idx.is_corrupted());
    }

    #[test]
    fn snapshot_round_trip_preserves_query_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let idx = index();
        idx.add(&make_chunks(
            Uuid::new_v4(),
            "Progress note",
            &["[PHI-PERSON] walked 50 meters", "Pain controlled with oral analgesia"],
        ))
        .unwrap();
        idx.save_snapshot(&path).unwrap();
        let before = idx.query("walked", 2, None).unwrap();

        let restored = index();
        assert_eq!(restored.load_snapshot(&path).unwrap(), 2);
        let after = restored.query("walked", 2, None).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn snapshot_dimension_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let idx = index();
        idx.add(&make_chunks(Uuid::new_v4(), "a", &["x1"])).unwrap();
        idx.save_snapshot(&path).unwrap();

        let other = VectorIndex::new(HashingEmbedder::with_dimension(16));
        assert!(matches!(
            other.load_snapshot(&path),
            Err(StorageError::DimensionMismatch { expected: 16, actual: 384 })
        ));
    }

    #[test]
    fn cosine_similarity_identical_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }
}
