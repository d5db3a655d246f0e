//! Consistency checker (spec.md §4.4): detects blocks with a missing
//! `block_meta` row (an I2 violation) and the lowest corrupt height, and
//! drives the rewind-then-recheck loop run at daemon startup and at the
//! top of every sync tick.

use sqlx::Row;

use super::row_ext::get_hash;
use super::BlockchainDb;
use crate::core::error::BlockchainResult;
use blockdb_common::model::Hash;

impl BlockchainDb {
    /// Returns `(true, [])` when consistent, otherwise `(false, hashes)`
    /// for every `blocks` row whose joined `block_meta.size IS NULL`.
    pub async fn check_consistency(&self) -> BlockchainResult<(bool, Vec<Hash>)> {
        let rows = sqlx::query(
            "SELECT blocks.hash AS hash FROM blocks \
             LEFT JOIN block_meta ON block_meta.hash = blocks.hash \
             WHERE block_meta.size IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok((true, Vec::new()));
        }

        let hashes = rows.iter().map(|r| get_hash(r, "hash")).collect::<BlockchainResult<Vec<_>>>()?;
        Ok((false, hashes))
    }

    /// Runs `check_consistency` in a loop, rewinding to the lowest
    /// inconsistent height each time, until the database is consistent
    /// (spec.md §4.4).
    pub async fn repair_consistency(&self) -> BlockchainResult<()> {
        loop {
            let (ok, inconsistent) = self.check_consistency().await?;
            if ok {
                return Ok(());
            }

            let mut lowest: Option<u64> = None;
            for hash in &inconsistent {
                if let Some(height) = self.height_from_hash(*hash).await? {
                    lowest = Some(lowest.map_or(height, |l: u64| l.min(height)));
                }
            }

            let Some(lowest) = lowest else {
                // Inconsistent hashes with no blockchain entry at all:
                // nothing to rewind to but 0, the safest recovery.
                warn!("inconsistent block(s) have no blockchain height, rewinding to genesis");
                self.rewind(0).await?;
                continue;
            };

            warn!(
                "consistency check found {} inconsistent hash(es), rewinding to height {lowest}",
                inconsistent.len()
            );
            self.rewind(lowest).await?;
        }
    }
}
