//! # Kumora Artifact Layer
//!
//! Typed cache entries for AI inference pipelines — embeddings, prompts,
//! retrieval chunks, rerank buffers and generated responses — layered on
//! top of the engine:
//!
//! - canonical key builders with stable separators,
//! - structured metadata with per-type defaults,
//! - content-addressed blob dedup with refcounts,
//! - secondary indices for bulk invalidation by epoch, model or prefix.

pub mod cache;
pub mod keys;
pub mod meta;

pub use cache::{AiStats, ArtifactCache, ArtifactValue};
pub use keys::{
    canonical_embedding_key, canonical_prompt_key, canonical_rag_chunk_key,
    canonical_rerank_key, canonical_response_key,
};
pub use meta::ArtifactMeta;
