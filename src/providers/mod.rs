//! External collaborators invoked from inside task handlers.
//!
//! The engine only requires that these be callable from a handler and that
//! failures surface as [`crate::error::ProviderError`] values the scheduler
//! can classify for retry.

pub mod embedding;
pub mod keywords;
pub mod llm;

pub use embedding::{EmbeddingService, HttpEmbeddings, SimilarityCenter};
pub use keywords::{CachedKeywords, KeywordMetrics, KeywordProvider, TwinwordKeywords};
pub use llm::{CompletionProvider, create_completion_provider};
