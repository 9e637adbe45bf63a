//! Probing for renamed or re-encrypted volumes.
//!
//! An index volume may declare a block volume under a name written with a
//! different codec pair than what is on the remote now (the operator
//! re-encrypted or re-compressed out of band). The probe regenerates the
//! canonical filename for every loaded `(compression, encryption)`
//! combination, plus no encryption, and takes the first name the index
//! database knows.

use sea_orm::ConnectionTrait;

use crate::codec::CodecRegistry;
use crate::db::find_volume_by_name;
use crate::error::Result;
use crate::remote::filename;

/// Returns `(volume_id, filename)` of the first matching candidate, or
/// `(-1, original)` when nothing matches.
pub async fn probe_for_renamed<C: ConnectionTrait>(
    conn: &C,
    registry: &CodecRegistry,
    original: &str,
) -> Result<(i64, String)> {
    let Some(parsed) = filename::parse(original) else {
        return Ok((-1, original.to_string()));
    };

    for compression in registry.compression_modules() {
        let mut encryptions: Vec<Option<&str>> = vec![None];
        encryptions.extend(registry.encryption_modules().into_iter().map(Some));
        for encryption in encryptions {
            let candidate = parsed.with_modules(compression, encryption);
            if candidate == original {
                continue;
            }
            if let Some(volume) = find_volume_by_name(conn, &candidate).await? {
                tracing::info!("Probed {} -> {}", original, candidate);
                return Ok((volume.id, candidate));
            }
        }
    }
    Ok((-1, original.to_string()))
}
