//! SeaORM entities, one per index table.
//!
//! Referential integrity between these tables is enforced at application
//! level by the engines; the set-oriented cascade work goes through raw
//! SQL rather than the entity API.

pub mod block;
pub mod blocklist_hash;
pub mod blockset;
pub mod blockset_entry;
pub mod change_journal_data;
pub mod deleted_block;
pub mod duplicate_block;
pub mod file_lookup;
pub mod fileset;
pub mod fileset_entry;
pub mod index_block_link;
pub mod metadataset;
pub mod path_prefix;
pub mod remote_volume;
pub mod small_blockset_link;
pub mod temp_blocklist_hash;
pub mod version;

/// Sentinel `blockset_id` for folder entries in `file_lookup`.
pub const FOLDER_BLOCKSET_ID: i64 = -100;

/// Sentinel `blockset_id` for symlink entries in `file_lookup`.
pub const SYMLINK_BLOCKSET_ID: i64 = -200;
