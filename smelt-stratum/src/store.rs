//! Durable share and block recording.
//!
//! Append-only rows keyed by the configured share-chain name; nothing here is
//! ever read back by the daemon (the public API reads this store through its
//! own query layer). [`SolveStore`] is the seam: Postgres in production, the
//! memory backend for tests and local development.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;

/// Errors from the recording backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// An append-only `block` row.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub height: i64,
    pub currency: String,
    /// Block hash, hex.
    pub hash: String,
    /// Proof-of-work hash, hex.
    pub powhash: String,
    pub subsidy: i64,
    pub mined_at: SystemTime,
    pub mined_by: String,
    /// Network difficulty as a decimal big-integer string.
    pub difficulty: String,
    pub chain: String,
}

/// An append-only `share` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareRow {
    pub username: String,
    pub difficulty: f64,
    pub mined_at: SystemTime,
    pub chain: String,
}

/// Recording backend.
#[async_trait]
pub trait SolveStore: Send + Sync {
    async fn insert_block(&self, block: &BlockRow) -> Result<(), StoreError>;
    async fn insert_share(&self, share: &ShareRow) -> Result<(), StoreError>;
}

/// Postgres-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the configured database. Fatal at boot when this fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SolveStore for PgStore {
    async fn insert_block(&self, block: &BlockRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO block
               (height, currency, hash, powhash, subsidy, mined_at, mined_by, difficulty, chain)
               VALUES ($1, $2, $3, $4, $5, to_timestamp($6), $7, $8, $9)"#,
        )
        .bind(block.height)
        .bind(&block.currency)
        .bind(&block.hash)
        .bind(&block.powhash)
        .bind(block.subsidy)
        .bind(epoch_seconds(block.mined_at))
        .bind(&block.mined_by)
        .bind(&block.difficulty)
        .bind(&block.chain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_share(&self, share: &ShareRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO share (username, difficulty, mined_at, chain)
               VALUES ($1, $2, to_timestamp($3), $4)"#,
        )
        .bind(&share.username)
        .bind(share.difficulty)
        .bind(epoch_seconds(share.mined_at))
        .bind(&share.chain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// In-memory store for tests and cpuminer experiments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<Vec<BlockRow>>,
    shares: Mutex<Vec<ShareRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<BlockRow> {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn shares(&self) -> Vec<ShareRow> {
        self.shares.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SolveStore for MemoryStore {
    async fn insert_block(&self, block: &BlockRow) -> Result<(), StoreError> {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(block.clone());
        Ok(())
    }

    async fn insert_share(&self, share: &ShareRow) -> Result<(), StoreError> {
        self.shares
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(share.clone());
        Ok(())
    }
}
