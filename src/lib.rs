//! Natural-language search over a personal photo library.
//!
//! Images are described by a vision model, the descriptions are embedded,
//! and queries are answered by exact cosine ranking over every stored
//! embedding of the active model.

pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod ratelimit;
pub mod scanner;
pub mod search;

pub use backend::{create_backend, Backend};
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use search::{run_query, QueryOptions, QueryResult};
