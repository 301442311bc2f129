use sqlx::{PgPool, Row};

use ratchet_core::error::Result;
use ratchet_core::settings::EngineSettings;

/// Store for the singleton engine-settings row.
///
/// All mutations row-lock the settings inside the same transaction as the
/// state change, so the lock flag and the running counter never race.
#[derive(Clone)]
pub struct EngineSettingsStore {
    pool: PgPool,
}

impl EngineSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Make sure the singleton row exists.
    pub async fn ensure(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_settings (id, global_lock, running_processes)
            VALUES (1, FALSE, 0)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read the current settings.
    pub async fn get(&self) -> Result<EngineSettings> {
        let row = sqlx::query("SELECT global_lock, running_processes FROM engine_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| EngineSettings {
                global_lock: r.get("global_lock"),
                running_processes: r.get("running_processes"),
            })
            .unwrap_or_default())
    }

    /// Set the global lock under a row lock, returning the settings as they
    /// were before the change.
    pub async fn set_global_lock(&self, lock: bool) -> Result<EngineSettings> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT global_lock, running_processes FROM engine_settings WHERE id = 1 FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await?;

        let previous = EngineSettings {
            global_lock: row.get("global_lock"),
            running_processes: row.get("running_processes"),
        };

        sqlx::query("UPDATE engine_settings SET global_lock = $1 WHERE id = 1")
            .bind(lock)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(previous)
    }

    /// Adjust the running-process counter by `delta`, clamped at zero.
    pub async fn adjust_running_processes(&self, delta: i32) -> Result<i32> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT running_processes FROM engine_settings WHERE id = 1 FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await?;

        let current: i32 = row.get("running_processes");
        let next = (current + delta).max(0);

        sqlx::query("UPDATE engine_settings SET running_processes = $1 WHERE id = 1")
            .bind(next)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }
}
