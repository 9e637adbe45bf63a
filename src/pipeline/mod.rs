//! Backup-side pipeline stages.
//!
//! The backup pipeline is a chain of cooperative tasks over bounded
//! channels: source scan, metadata pre-processing, block splitting, and
//! volume management. The chunker and volume writers are external
//! collaborators; this module hosts the stages that belong to the core.

pub mod metadata;
