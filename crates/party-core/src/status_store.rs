//! Per-analysis status/result persistence over SQLite via sqlx.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};

use crate::error::StoreError;
use crate::model::AnalysisStatus;

#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    pub analysis_id: String,
    pub status: AnalysisStatus,
    pub result: Option<String>,
}

#[derive(Clone)]
pub struct StatusStore {
    pool: SqlitePool,
}

impl StatusStore {
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Admits a new analysis or resets an existing one back to `Queuing`,
    /// overwriting rather than rejecting a duplicate id.
    pub async fn create_entry(&self, analysis_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO inference_results (analysis_id, status) VALUES (?, 'Queuing')
             ON CONFLICT(analysis_id) DO UPDATE SET status = 'Queuing'",
        )
        .bind(analysis_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, analysis_id: &str, status: &AnalysisStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE inference_results SET status = ? WHERE analysis_id = ?")
            .bind(status.encode())
            .bind(analysis_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Appends to the existing result rather than overwriting it, so a
    /// streaming analysis that emits more than one partial result keeps
    /// them all.
    pub async fn append_result(&self, analysis_id: &str, result: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE inference_results
             SET result = COALESCE(result, '') || ?
             WHERE analysis_id = ?",
        )
        .bind(result)
        .bind(analysis_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read(&self, analysis_id: &str) -> Result<AnalysisRecord, StoreError> {
        let row: Option<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT analysis_id, status, result FROM inference_results WHERE analysis_id = ?",
        )
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await?;

        let (analysis_id, status, result) =
            row.ok_or_else(|| StoreError::NotFound(analysis_id.to_string()))?;
        Ok(AnalysisRecord {
            analysis_id,
            status: AnalysisStatus::parse(&status),
            result,
        })
    }

    pub async fn delete(&self, analysis_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inference_results WHERE analysis_id = ?")
            .bind(analysis_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_store() -> StatusStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.db");
        let store = StatusStore::open(&path).await.unwrap();
        std::mem::forget(dir);
        store
    }

    #[tokio::test]
    async fn create_then_read_starts_queuing() {
        let store = open_test_store().await;
        store.create_entry("a1").await.unwrap();
        let record = store.read("a1").await.unwrap();
        assert_eq!(record.status, AnalysisStatus::Queuing);
        assert_eq!(record.result, None);
    }

    #[tokio::test]
    async fn recreate_resets_status_to_queuing() {
        let store = open_test_store().await;
        store.create_entry("a1").await.unwrap();
        store
            .set_status(
                "a1",
                &AnalysisStatus::Error {
                    code: 500,
                    message: "boom".into(),
                },
            )
            .await
            .unwrap();
        store.create_entry("a1").await.unwrap();
        let record = store.read("a1").await.unwrap();
        assert_eq!(record.status, AnalysisStatus::Queuing);
    }

    #[tokio::test]
    async fn append_result_concatenates() {
        let store = open_test_store().await;
        store.create_entry("a1").await.unwrap();
        store.append_result("a1", "aa").await.unwrap();
        store.append_result("a1", "bb").await.unwrap();
        let record = store.read("a1").await.unwrap();
        assert_eq!(record.result.as_deref(), Some("aabb"));
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let store = open_test_store().await;
        let err = store.read("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = open_test_store().await;
        store.create_entry("a1").await.unwrap();
        store.delete("a1").await.unwrap();
        assert!(store.read("a1").await.is_err());
    }
}
