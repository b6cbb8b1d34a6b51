pub mod entity;
pub mod error;
pub mod ids;
pub mod payload;

pub use entity::{Entity, LocalDelete, SyncState};
pub use error::CoreError;
pub use ids::*;
pub use payload::*;
