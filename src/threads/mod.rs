//! Conversation threading: subject normalization, the union-find arena, and
//! the batch resolver.

pub mod resolver;
pub mod subject;
pub mod union_find;

pub use resolver::{ThreadConflict, ThreadResolution, ThreadResolver};
pub use union_find::ThreadArena;
