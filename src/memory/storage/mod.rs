//! Long-term memory persistence.

pub mod memory_store;
pub mod sqlite_vec_loader;
pub mod sqlite_vector_index;
pub mod vector_index;

pub use memory_store::{LongTermMemory, render_memory_pack};
pub use sqlite_vec_loader::init_sqlite_vec_extension;
pub use sqlite_vector_index::SqliteVectorIndex;
pub use vector_index::{InMemoryVectorIndex, IndexFuture, VectorHit, VectorIndex, cosine_similarity};
