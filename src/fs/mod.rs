pub mod backend;
pub mod local;

pub use backend::{ByteStream, FileRecord, StorageBackend, WriteMetadata};
pub use local::LocalBackend;
