//! Core types shared by every part of the engine.

#[path = "data_model/1-path.rs"]
mod path;
pub use path::*;

#[path = "data_model/2-entity.rs"]
mod entity;
pub use entity::*;

#[path = "data_model/3-pending-write.rs"]
mod pending_write;
pub use pending_write::*;

#[path = "data_model/4-cache-entry.rs"]
mod cache_entry;
pub use cache_entry::*;
