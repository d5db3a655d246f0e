//! Schema manager (spec.md §4.2): issues the `CREATE TABLE` statements for
//! every table in spec.md §3 inside one transaction. Re-running `init` on
//! an existing schema is a no-op because every statement is
//! `IF NOT EXISTS`.

use sqlx::AnyPool;

use super::error::BlockchainResult;

/// Column type names are backend-neutral SQL (`TEXT`, `BLOB`, `BIGINT`,
/// `INTEGER`) that every sqlx-supported backend accepts; the concrete
/// storage (MySQL/Postgres/SQLite) is the external collaborator spec.md §1
/// calls out, so no backend-specific DDL lives here.
const CREATE_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS blocks (
        hash TEXT PRIMARY KEY,
        data BLOB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS blockchain (
        height BIGINT PRIMARY KEY,
        hash TEXT NOT NULL,
        utctimestamp BIGINT NOT NULL,
        FOREIGN KEY (hash) REFERENCES blocks(hash) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS block_meta (
        hash TEXT PRIMARY KEY,
        prevHash TEXT NOT NULL,
        baseReward BIGINT NOT NULL,
        difficulty BIGINT NOT NULL,
        majorVersion INTEGER NOT NULL,
        minorVersion INTEGER NOT NULL,
        nonce BIGINT NOT NULL,
        size BIGINT NOT NULL,
        alreadyGeneratedCoins BIGINT NOT NULL,
        alreadyGeneratedTransactions BIGINT NOT NULL,
        reward BIGINT NOT NULL,
        sizeMedian BIGINT NOT NULL,
        totalFeeAmount BIGINT NOT NULL,
        transactionsCumulativeSize BIGINT NOT NULL,
        transactionsCount INTEGER NOT NULL,
        orphan INTEGER NOT NULL,
        penalty DOUBLE PRECISION NOT NULL,
        FOREIGN KEY (hash) REFERENCES blocks(hash) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transactions (
        hash TEXT PRIMARY KEY,
        block_hash TEXT NOT NULL,
        coinbase INTEGER NOT NULL,
        data BLOB NOT NULL,
        FOREIGN KEY (block_hash) REFERENCES blocks(hash) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transaction_meta (
        hash TEXT PRIMARY KEY,
        fee BIGINT NOT NULL,
        amount BIGINT NOT NULL,
        size BIGINT NOT NULL,
        FOREIGN KEY (hash) REFERENCES transactions(hash) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transaction_inputs (
        hash TEXT NOT NULL,
        keyImage TEXT PRIMARY KEY,
        amount BIGINT NOT NULL,
        FOREIGN KEY (hash) REFERENCES transactions(hash) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transaction_outputs (
        hash TEXT NOT NULL,
        idx INTEGER NOT NULL,
        amount BIGINT NOT NULL,
        outputKey TEXT NOT NULL,
        globalIdx BIGINT,
        PRIMARY KEY (hash, idx),
        FOREIGN KEY (hash) REFERENCES transactions(hash) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transaction_paymentids (
        hash TEXT NOT NULL,
        paymentId TEXT NOT NULL,
        PRIMARY KEY (hash, paymentId),
        FOREIGN KEY (hash) REFERENCES transactions(hash) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transaction_pool (
        hash TEXT PRIMARY KEY,
        fee BIGINT NOT NULL,
        size BIGINT NOT NULL,
        amount BIGINT NOT NULL,
        data BLOB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS information (
        idx TEXT PRIMARY KEY,
        data BLOB NOT NULL
    )"#,
];

/// Idempotent: creates every table in spec.md §3 (and their foreign-key
/// cascades) inside a single transaction. Safe to call on every startup.
pub async fn init(pool: &AnyPool) -> BlockchainResult<()> {
    let mut tx = pool.begin().await?;
    for stmt in CREATE_TABLES {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    debug!("schema initialized ({} tables)", CREATE_TABLES.len());
    Ok(())
}
