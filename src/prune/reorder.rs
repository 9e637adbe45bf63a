//! Delete ordering for paired block and index volumes.
//!
//! An index volume may only leave the remote after every block volume it
//! describes is gone, otherwise a listing taken in between shows an index
//! file pointing at nothing. The reorder keeps the caller's block-volume
//! order and splices each index volume in right after the last block
//! volume referencing it.

use std::collections::{HashMap, HashSet};

use sea_orm::ConnectionTrait;

use crate::db::query_rows;
use crate::error::Result;

/// A volume queued for remote deletion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletableVolume {
    pub volume_id: i64,
    pub name: String,
    pub size: i64,
}

/// `(index_volume, block_volume)` pairs from the `index_block_link` table.
pub async fn load_index_links<C: ConnectionTrait>(conn: &C) -> Result<Vec<(i64, i64)>> {
    let rows = query_rows(
        conn,
        r#"SELECT "index_volume_id", "block_volume_id" FROM "index_block_link""#,
        vec![],
    )
    .await?;
    let mut links = Vec::with_capacity(rows.len());
    for row in rows {
        links.push((row.try_get_by_index(0)?, row.try_get_by_index(1)?));
    }
    Ok(links)
}

/// Reorder deletions: yields the given volumes in their original order,
/// inserting each index volume from `index_volumes` immediately after the
/// last deletable block volume it references. Index volumes whose block
/// volumes are not all being deleted are withheld.
pub fn reorder_deletable(
    volumes: Vec<DeletableVolume>,
    links: &[(i64, i64)],
    index_volumes: &HashMap<i64, DeletableVolume>,
) -> Vec<DeletableVolume> {
    let deletable_blocks: HashSet<i64> = volumes.iter().map(|v| v.volume_id).collect();

    // index volume -> every block volume it references
    let mut referenced: HashMap<i64, HashSet<i64>> = HashMap::new();
    for (index_id, block_id) in links {
        if index_volumes.contains_key(index_id) {
            referenced.entry(*index_id).or_default().insert(*block_id);
        }
    }

    // Only indexes whose referenced block volumes are all going away may
    // be deleted this round.
    let mut pending_blocks: HashMap<i64, HashSet<i64>> = HashMap::new();
    let mut block_to_indexes: HashMap<i64, Vec<i64>> = HashMap::new();
    for (index_id, blocks) in &referenced {
        if blocks.iter().all(|b| deletable_blocks.contains(b)) {
            pending_blocks.insert(*index_id, blocks.clone());
            for block_id in blocks {
                block_to_indexes.entry(*block_id).or_default().push(*index_id);
            }
        }
    }

    let mut ordered = Vec::with_capacity(volumes.len() + index_volumes.len());
    let mut emitted_indexes = HashSet::new();
    for volume in volumes {
        let block_id = volume.volume_id;
        ordered.push(volume);
        if let Some(indexes) = block_to_indexes.get(&block_id) {
            for index_id in indexes {
                let Some(pending) = pending_blocks.get_mut(index_id) else {
                    continue;
                };
                pending.remove(&block_id);
                if pending.is_empty() && emitted_indexes.insert(*index_id) {
                    if let Some(index_volume) = index_volumes.get(index_id) {
                        ordered.push(index_volume.clone());
                    }
                }
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(id: i64) -> DeletableVolume {
        DeletableVolume {
            volume_id: id,
            name: format!("vol-{}", id),
            size: id * 10,
        }
    }

    fn index_map(ids: &[i64]) -> HashMap<i64, DeletableVolume> {
        ids.iter().map(|id| (*id, vol(*id))).collect()
    }

    #[test]
    fn test_index_follows_last_block() {
        // Index 10 describes blocks 1 and 3; index 11 describes block 2.
        let links = vec![(10, 1), (10, 3), (11, 2)];
        let ordered = reorder_deletable(
            vec![vol(1), vol(2), vol(3)],
            &links,
            &index_map(&[10, 11]),
        );
        let ids: Vec<i64> = ordered.iter().map(|v| v.volume_id).collect();
        // Block order preserved; 11 right after 2, 10 only after 3.
        assert_eq!(ids, vec![1, 2, 11, 3, 10]);
    }

    #[test]
    fn test_index_emitted_exactly_once() {
        let links = vec![(10, 1), (10, 2)];
        let ordered = reorder_deletable(vec![vol(1), vol(2)], &links, &index_map(&[10]));
        let index_count = ordered.iter().filter(|v| v.volume_id == 10).count();
        assert_eq!(index_count, 1);
        let ids: Vec<i64> = ordered.iter().map(|v| v.volume_id).collect();
        assert_eq!(ids, vec![1, 2, 10]);
    }

    #[test]
    fn test_index_with_surviving_block_withheld() {
        // Index 10 also describes block 9, which is not being deleted.
        let links = vec![(10, 1), (10, 9)];
        let ordered = reorder_deletable(vec![vol(1)], &links, &index_map(&[10]));
        let ids: Vec<i64> = ordered.iter().map(|v| v.volume_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_no_links_passthrough() {
        let ordered = reorder_deletable(vec![vol(2), vol(1)], &[], &HashMap::new());
        let ids: Vec<i64> = ordered.iter().map(|v| v.volume_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
