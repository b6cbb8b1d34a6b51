pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::CacheError;
pub use sqlite::SqliteCache;
pub use traits::*;
