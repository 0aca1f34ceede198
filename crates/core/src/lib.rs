pub mod hash;
pub mod model;
pub mod path_map;

pub use hash::{content_hash, hash_reader, is_sentinel, IntegrityHasher, SENTINEL_HASH};
pub use model::{BackupSet, FileTransaction, RunLogEntry, Volume, SCHEMA_VERSION};
pub use path_map::{map_destination, relative_destination, MapError};
