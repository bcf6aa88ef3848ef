//! Storage backends for newswire
//!
//! Every backend implements the `ArticleStore` trait. `SqliteStore` is the
//! default; `PgStore` is available with the `postgres` feature.

#[cfg(feature = "postgres")]
mod postgres;
mod sqlite;
mod traits;

#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use sqlite::SqliteStore;
pub use traits::{
    ArticleStore, ClaimRequest, Claimed, FailureRecord, OpenStore, StageStats, StorageError,
    StorageResult,
};

use crate::config::{Backend, StoreConfig};
use std::sync::Arc;

/// Open the backend selected by `config`.
pub async fn connect(config: &StoreConfig) -> StorageResult<Arc<dyn ArticleStore>> {
    match config.backend {
        Backend::Sqlite => {
            let store = SqliteStore::open_with_timeout(&config.path, config.connection.connect_timeout())?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        Backend::Postgres => {
            let store = PgStore::connect(&config.connection).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Backend::Postgres => Err(StorageError::Unsupported(
            "postgres backend requires the `postgres` feature".to_string(),
        )),
    }
}
