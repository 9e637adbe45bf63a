//! Compression and encryption module registries.
//!
//! The engine never hard-codes a codec: remote filenames carry the module
//! names as extensions, and the recreate engine probes the cross-product of
//! registered modules when a volume was re-encrypted or re-compressed out
//! of band. Registries are plain ordered name→implementation mappings.

use std::path::Path;

use crate::error::Result;

/// Whole-file encryption applied to a finished volume before upload.
///
/// The engine ships no cipher of its own; real implementations (AES,
/// GPG, ...) are provided by the embedding application. [`Passthrough`]
/// exists for unencrypted targets and for exercising the probing logic.
pub trait EncryptionCodec: Send + Sync {
    /// Module name; doubles as the trailing filename extension.
    fn name(&self) -> &str;

    fn encrypt(&self, source: &Path, dest: &Path, passphrase: &str) -> Result<()>;

    fn decrypt(&self, source: &Path, dest: &Path, passphrase: &str) -> Result<()>;
}

/// Identity codec: copies bytes unchanged. Used where a named encryption
/// slot is required but the target is unencrypted.
pub struct Passthrough {
    name: String,
}

impl Passthrough {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EncryptionCodec for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn encrypt(&self, source: &Path, dest: &Path, _passphrase: &str) -> Result<()> {
        std::fs::copy(source, dest)?;
        Ok(())
    }

    fn decrypt(&self, source: &Path, dest: &Path, _passphrase: &str) -> Result<()> {
        std::fs::copy(source, dest)?;
        Ok(())
    }
}

/// Ordered registry of loaded codec modules.
pub struct CodecRegistry {
    compression: Vec<String>,
    encryption: Vec<Box<dyn EncryptionCodec>>,
}

impl CodecRegistry {
    /// Registry with the built-in zip container and no encryption modules.
    pub fn new() -> Self {
        Self {
            compression: vec!["zip".to_string()],
            encryption: Vec::new(),
        }
    }

    pub fn register_compression(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.compression.iter().any(|c| *c == name) {
            self.compression.push(name);
        }
    }

    pub fn register_encryption(&mut self, codec: Box<dyn EncryptionCodec>) {
        self.encryption.push(codec);
    }

    pub fn compression_modules(&self) -> &[String] {
        &self.compression
    }

    pub fn encryption_modules(&self) -> Vec<&str> {
        self.encryption.iter().map(|c| c.name()).collect()
    }

    pub fn encryption(&self, name: &str) -> Option<&dyn EncryptionCodec> {
        self.encryption
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
