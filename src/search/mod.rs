//! Exact top-K similarity search over stored embeddings.

pub mod pipeline;
pub mod similarity;
pub mod topk;

pub use pipeline::{run_query, QueryOptions, QueryResult};
pub use similarity::cosine_similarity;
pub use topk::{Scored, TopK};
