//! Rewind engine (spec.md §4.3/§4.4): deletes the suffix of the chain at
//! and above a given height. Deletions happen one block at a time, each in
//! its own transaction, so a single failing delete can be re-queued
//! without losing progress already made on the rest of the batch.

use sqlx::Row;

use super::row_ext::get_hash;
use super::BlockchainDb;
use crate::core::error::BlockchainResult;

impl BlockchainDb {
    /// Deletes every block at height >= `height`. Foreign-key cascades
    /// (spec.md §3) remove the dependent blockchain/transactions/meta/
    /// inputs/outputs/payment-id rows for free.
    pub async fn rewind(&self, height: u64) -> BlockchainResult<()> {
        let rows = sqlx::query("SELECT hash FROM blockchain WHERE height >= ?")
            .bind(height as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut pending: Vec<String> = Vec::with_capacity(rows.len());
        for row in &rows {
            pending.push(get_hash(row, "hash")?.to_hex());
        }

        if pending.is_empty() {
            return Ok(());
        }

        warn!("rewinding {} block(s) at/above height {height}", pending.len());

        while let Some(hash) = pending.pop() {
            match self.delete_one_block(&hash).await {
                Ok(()) => {}
                Err(e) => {
                    warn!("rewind delete of {hash} failed, re-queuing: {e}");
                    pending.insert(0, hash);
                }
            }
        }

        Ok(())
    }

    async fn delete_one_block(&self, hash: &str) -> BlockchainResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blocks WHERE hash = ?").bind(hash).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// The CLI's `reset` operation (spec.md §6): truncates `blocks`,
    /// `information`, and `transaction_pool`. Only `blocks` has dependents
    /// reachable via cascade (spec.md §3); `information` and
    /// `transaction_pool` aren't children of any other table and must be
    /// truncated explicitly.
    pub async fn reset(&self) -> BlockchainResult<()> {
        self.rewind(0).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM information").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM transaction_pool").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
