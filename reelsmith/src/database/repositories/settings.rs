//! Runtime-tunable orchestrator settings (key/value).

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::WritePool;
use crate::database::models::SettingDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

pub const SETTING_MAX_RETRIES: &str = "max_retries";
pub const SETTING_POLL_INTERVAL_MS: &str = "poll_interval_ms";

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    async fn list_settings(&self) -> Result<Vec<SettingDbModel>>;
}

pub struct SqlxSettingsRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxSettingsRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl SettingsRepository for SqlxSettingsRepository {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM orchestrator_setting WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        retry_on_sqlite_busy("set_setting", || async {
            sqlx::query(
                r#"
                INSERT INTO orchestrator_setting (key, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now_ms())
            .execute(&self.write_pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_settings(&self) -> Result<Vec<SettingDbModel>> {
        Ok(
            sqlx::query_as::<_, SettingDbModel>("SELECT * FROM orchestrator_setting ORDER BY key")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}
