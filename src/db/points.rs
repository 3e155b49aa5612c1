/// `db/points.rs` — SQLite-backed point balances
use std::path::Path;

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

use crate::{
    capabilities::points::PointsLedger,
    error::{HubError, HubResult},
};

pub struct SqlitePointsLedger {
    pool: SqlitePool,
}

impl SqlitePointsLedger {
    /// Open (or create) the database at `path` and make sure the table exists.
    pub async fn open(path: &Path) -> HubResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HubError::io(parent, e))?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await?;
        run_migrations(&pool).await?;
        log::info!("[points] Ledger opened at {}", path.display());
        Ok(Self { pool })
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_points (
            user_id     TEXT    PRIMARY KEY,
            balance     INTEGER NOT NULL DEFAULT 0,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl PointsLedger for SqlitePointsLedger {
    async fn get(&self, user_id: &str) -> HubResult<i64> {
        let row = sqlx::query("SELECT balance FROM user_points WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("balance")).unwrap_or(0))
    }

    async fn set(&self, user_id: &str, amount: i64) -> HubResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_points (user_id, balance) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                balance = excluded.balance,
                updated_at = strftime('%s','now')
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add(&self, user_id: &str, amount: i64) -> HubResult<i64> {
        sqlx::query(
            r#"
            INSERT INTO user_points (user_id, balance) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                balance = balance + excluded.balance,
                updated_at = strftime('%s','now')
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        self.get(user_id).await
    }

    async fn take(&self, user_id: &str, amount: i64) -> HubResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_points
            SET balance = balance - ?, updated_at = strftime('%s','now')
            WHERE user_id = ? AND balance >= ?
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn balances_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("points.db");

        let ledger = SqlitePointsLedger::open(&path).await.unwrap();
        assert_eq!(ledger.get("alice").await.unwrap(), 0);
        ledger.set("alice", 100).await.unwrap();
        assert_eq!(ledger.add("alice", 25).await.unwrap(), 125);
        assert_eq!(ledger.add("bob", 7).await.unwrap(), 7);
        ledger.pool.close().await;

        let reopened = SqlitePointsLedger::open(&path).await.unwrap();
        assert_eq!(reopened.get("alice").await.unwrap(), 125);
        assert_eq!(reopened.get("bob").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn take_requires_sufficient_balance() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqlitePointsLedger::open(&dir.path().join("points.db")).await.unwrap();

        assert!(!ledger.take("ghost", 1).await.unwrap());
        ledger.set("alice", 10).await.unwrap();
        assert!(!ledger.take("alice", 11).await.unwrap());
        assert!(ledger.take("alice", 10).await.unwrap());
        assert_eq!(ledger.get("alice").await.unwrap(), 0);
    }
}
