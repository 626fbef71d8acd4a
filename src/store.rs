use crate::{
    config::AppConfig,
    entity::{ChatbotData, ChatbotDataList},
};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};
use tracing::{debug, warn};

const CONFIG_KEY: &str = "app";

/// Chatbots and settings, each stored as one JSON document per row.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chatbots (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Insert or replace one chatbot.
    pub async fn save_chatbot(&self, data: &ChatbotData) -> Result<()> {
        let json = serde_json::to_string(data)?;
        sqlx::query(
            r#"
            INSERT INTO chatbots (id, data, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&data.id)
        .bind(json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save chatbot {}", data.id))?;

        Ok(())
    }

    /// Replace the stored chatbots with `list`. Chatbots missing from `list`
    /// are deleted.
    pub async fn save_chatbots(&self, list: &ChatbotDataList) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chatbots")
            .execute(&mut *tx)
            .await
            .context("Failed to clear chatbots")?;

        let now = Utc::now();
        for data in list.iter() {
            sqlx::query("INSERT INTO chatbots (id, data, updated_at) VALUES (?, ?, ?)")
                .bind(&data.id)
                .bind(serde_json::to_string(data)?)
                .bind(now)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to save chatbot {}", data.id))?;
        }

        tx.commit().await.context("Failed to commit chatbots")?;
        debug!("Saved {} chatbots", list.len());
        Ok(())
    }

    /// Load every chatbot, most active first. Rows that no longer parse are
    /// skipped with a warning.
    pub async fn load_chatbots(&self) -> Result<ChatbotDataList> {
        let rows = sqlx::query("SELECT id, data FROM chatbots")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch chatbots")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let json: String = row.try_get("data")?;
            match serde_json::from_str::<ChatbotData>(&json) {
                Ok(data) => items.push(data),
                Err(e) => warn!("Skipping unreadable chatbot {}: {}", id, e),
            }
        }

        let mut list = ChatbotDataList::new(items);
        list.sort_by_activity();
        Ok(list)
    }

    pub async fn delete_chatbot(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chatbots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete chatbot")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config (key, data) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(CONFIG_KEY)
        .bind(serde_json::to_string(config)?)
        .execute(&self.pool)
        .await
        .context("Failed to save config")?;

        Ok(())
    }

    /// The stored settings, or `None` on first start.
    pub async fn load_config(&self) -> Result<Option<AppConfig>> {
        let row = sqlx::query("SELECT data FROM config WHERE key = ?")
            .bind(CONFIG_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch config")?;

        match row {
            Some(row) => {
                let json: String = row.try_get("data")?;
                let config = serde_json::from_str(&json).context("Stored config is not valid")?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }
}
