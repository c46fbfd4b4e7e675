//! The Embedder (spec §4.3): a fixed-dimension text-embedding capability.
//!
//! Model download/inference internals are an out-of-scope external
//! capability per `spec.md` §1; this module models it as a trait with a
//! lazily-initialized, process-global default backed by `fastembed`
//! (grounded in `vyotiq-ai-vyotiq-agent/rust-backend/src/embedder.rs`'s
//! `EmbeddingManager` singleton and `codex-rs/retrieval`'s
//! `EmbeddingProvider` trait shape), matching §9's "global embedder holds a
//! lazily-initialized model resource with process-lifetime ... wrap it in a
//! mutex to serialize inference".

#[cfg(feature = "local-embeddings")]
use std::sync::Mutex;
#[cfg(feature = "local-embeddings")]
use std::sync::OnceLock;

use async_trait::async_trait;

use crate::error::MemoryError;
use crate::error::Result;
use crate::types::EMBEDDING_DIM;

/// A fixed-dimension, L2-normalized text embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    async fn available(&self) -> bool;
    fn dimensions(&self) -> u16 {
        EMBEDDING_DIM
    }
}

/// L2-normalize in place; a no-op on an already-unit vector.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn validate_dimension(v: &[f32]) -> Result<()> {
    if v.len() != EMBEDDING_DIM as usize {
        return Err(MemoryError::EmbeddingDimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: v.len(),
        });
    }
    Ok(())
}

#[cfg(feature = "local-embeddings")]
mod fastembed_backend {
    use super::*;
    use fastembed::EmbeddingModel;
    use fastembed::InitOptions;
    use fastembed::TextEmbedding;

    /// Wraps a lazily-loaded `fastembed` model. Inference is serialized
    /// through a blocking mutex (the model itself is not `Sync`); a
    /// negative availability probe is cached for the process lifetime
    /// per §4.3.
    pub struct FastEmbedEmbedder {
        model: OnceLock<Option<Mutex<TextEmbedding>>>,
    }

    impl FastEmbedEmbedder {
        pub fn new() -> Self {
            Self { model: OnceLock::new() }
        }

        fn model(&self) -> &Option<Mutex<TextEmbedding>> {
            self.model.get_or_init(|| {
                TextEmbedding::try_new(
                    InitOptions::new(EmbeddingModel::BGEBaseENV15).with_show_download_progress(false),
                )
                .ok()
                .map(Mutex::new)
            })
        }
    }

    impl Default for FastEmbedEmbedder {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let out = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
            out.into_iter().next().ok_or_else(|| MemoryError::EmbeddingDimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: 0,
            })
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let texts = texts.to_vec();
            let model_slot = self.model();
            let Some(model) = model_slot else {
                return Err(MemoryError::EmbeddingDimensionMismatch {
                    expected: EMBEDDING_DIM,
                    actual: 0,
                });
            };
            let guard = model.lock().unwrap_or_else(|p| p.into_inner());
            let embeddings = guard.embed(texts, None).map_err(|e| MemoryError::Config {
                field: "embedder".to_string(),
                cause: e.to_string(),
            })?;

            let mut out = Vec::with_capacity(embeddings.len());
            for mut v in embeddings {
                l2_normalize(&mut v);
                validate_dimension(&v)?;
                out.push(v);
            }
            Ok(out)
        }

        async fn available(&self) -> bool {
            self.model().is_some()
        }
    }
}

#[cfg(feature = "local-embeddings")]
pub use fastembed_backend::FastEmbedEmbedder;

/// Embedder that always reports unavailable — the default when the
/// `local-embeddings` feature is disabled, and used in tests. Search and
/// sync degrade to lexical-only against it, per §4.1's failure modes.
#[derive(Debug, Default)]
pub struct UnavailableEmbedder;

#[async_trait]
impl Embedder for UnavailableEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(MemoryError::EmbeddingDimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: 0,
        })
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(Vec::new())
    }

    async fn available(&self) -> bool {
        false
    }
}

/// Construct the default process-wide embedder for the enabled feature set.
pub fn default_embedder() -> Box<dyn Embedder> {
    #[cfg(feature = "local-embeddings")]
    {
        Box::new(FastEmbedEmbedder::new())
    }
    #[cfg(not(feature = "local-embeddings"))]
    {
        Box::new(UnavailableEmbedder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let mut v = vec![3.0_f32, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unavailable_embedder_reports_unavailable() {
        let e = UnavailableEmbedder;
        assert!(!e.available().await);
        assert!(e.embed_batch(&[]).await.unwrap().is_empty());
    }
}
