//! Legacy database encryption handling.
//!
//! Old builds could wrap the whole SQLite file in an RC4 stream keyed by
//! the SHA-256 of the passphrase. Opening such a file triggers one
//! automatic decrypt attempt; anything else that is not a SQLite file is
//! refused with a stable error.

use std::io::{Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{ids, EngineError, Result};

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// RC4 keystream. Only used to decrypt legacy database files in place;
/// nothing new is ever encrypted with it.
struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s
                [(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

fn key_from_passphrase(passphrase: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.finalize().to_vec()
}

fn is_sqlite(path: &Path) -> Result<bool> {
    let mut header = [0u8; 16];
    let mut file = std::fs::File::open(path)?;
    match file.read_exact(&mut header) {
        Ok(()) => Ok(header == *SQLITE_MAGIC),
        // Shorter than a header: empty databases are created plaintext.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Make sure the file at `path` is a plaintext SQLite database, running
/// the legacy decrypt attempt when it is not and a passphrase is at hand.
pub fn ensure_plaintext(path: &Path, passphrase: Option<&str>) -> Result<()> {
    if is_sqlite(path)? {
        return Ok(());
    }
    let Some(passphrase) = passphrase else {
        return Err(EngineError::user(
            ids::ENCRYPTED_DATABASE,
            format!(
                "database {} appears encrypted and no passphrase is configured",
                path.display()
            ),
        ));
    };

    tracing::info!(
        "Database {} is not plaintext, attempting legacy decrypt",
        path.display()
    );
    let mut data = std::fs::read(path)?;
    Rc4::new(&key_from_passphrase(passphrase)).apply(&mut data);
    if !data.starts_with(SQLITE_MAGIC) {
        return Err(EngineError::user(
            ids::ENCRYPTED_DATABASE,
            format!(
                "legacy decrypt of {} did not produce a database; wrong passphrase?",
                path.display()
            ),
        ));
    }

    // Write to a sibling temp file and swap, so a crash mid-write cannot
    // destroy the only copy.
    let tmp = path.with_extension("decrypting");
    {
        let mut out = std::fs::File::create(&tmp)?;
        out.write_all(&data)?;
        out.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    tracing::info!("Legacy decrypt of {} succeeded", path.display());
    Ok(())
}
