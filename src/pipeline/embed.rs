//! Embedding and vector storage seams
//!
//! Real deployments plug an embedding provider and a vector database in
//! behind these traits. The in-process implementations back the CLI and the
//! tests.

use crate::{IngestError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Width of every vector this embedder produces
    fn dimensions(&self) -> usize;

    /// Embeds each text into one vector, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// One embedded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: String,
    pub url: String,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces records by chunk id
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;
}

/// Deterministic feature-hashing embedder
///
/// Each lowercase token is hashed with SHA-256; the first eight bytes pick a
/// dimension and a sign. Vectors are L2-normalized, so texts sharing
/// vocabulary land close together.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let hash = u64::from_le_bytes(bucket);
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.dimensions == 0 {
            return Err(IngestError::Embedding("embedder has zero dimensions".into()));
        }
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Vector store held in process memory
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    records: DashMap<Uuid, VectorRecord>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chunk_id: &Uuid) -> Option<VectorRecord> {
        self.records.get(chunk_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        for record in records {
            self.records.insert(record.chunk_id, record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let texts = vec!["Rust ownership rules".to_string(), "rust OWNERSHIP rules".to_string()];
        let vectors = embedder.embed(&texts).await.unwrap();

        assert_eq!(vectors[0].len(), 64);
        assert_eq!(vectors[0], vectors[1]);
        assert!((cosine(&vectors[0], &vectors[0]) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new(256);
        let vectors = embedder
            .embed(&[
                "tokio async runtime tasks".to_string(),
                "async runtime tasks scheduling".to_string(),
                "banana bread recipe".to_string(),
            ])
            .await
            .unwrap();
        assert!(cosine(&vectors[0], &vectors[1]) > cosine(&vectors[0], &vectors[2]));
    }

    #[tokio::test]
    async fn test_empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        let vectors = embedder.embed(&[String::new()]).await.unwrap();
        assert!(vectors[0].iter().all(|v| *v == 0.0));
    }

    #[tokio::test]
    async fn test_vector_store_upserts_by_chunk_id() {
        let store = MemoryVectorStore::new();
        let id = Uuid::new_v4();
        let record = |value: f32| VectorRecord {
            chunk_id: id,
            run_id: Uuid::nil(),
            tenant_id: "t".into(),
            url: "https://example.com/".into(),
            vector: vec![value],
        };
        store.upsert(vec![record(1.0)]).await.unwrap();
        store.upsert(vec![record(2.0)]).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id).unwrap().vector, vec![2.0]);
    }
}
