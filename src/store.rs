use crate::{
    chat::ChatMessage,
    entity::{GoogleCredentials, Usage, UsageKind, User},
};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{path::Path, str::FromStr};

/// Attempts at a usage update before giving up on concurrent writers.
const USAGE_RETRIES: usize = 16;

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
            if !parent.as_os_str().is_empty() && !parent.exists() {
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

    /// A private in-memory database. The pool is pinned to one connection,
    /// since every SQLite `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'text',
                metadata TEXT NOT NULL DEFAULT '{}',
                timestamp DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_user_timestamp ON messages(user_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_session_timestamp ON messages(session_id, timestamp);

            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                google_access_token TEXT,
                google_refresh_token TEXT,
                permissions TEXT NOT NULL DEFAULT '[]',
                usage TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    /// Save a chat message to the store.
    pub async fn save_message(&self, msg: &ChatMessage) -> Result<()> {
        let metadata = serde_json::to_string(&msg.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO messages (message_id, user_id, session_id, role, content, message_type, metadata, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.message_id)
        .bind(&msg.user_id)
        .bind(&msg.session_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(&msg.message_type)
        .bind(metadata)
        .bind(msg.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to save message")?;

        Ok(())
    }

    /// Retrieve the most recent messages of a user, optionally limited to one
    /// session. Returns messages ordered oldest to newest.
    pub async fn get_chat_history(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, user_id, session_id, role, content, message_type, metadata, timestamp
            FROM messages
            WHERE user_id = ? AND (? IS NULL OR session_id = ?)
            ORDER BY timestamp DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch chat history")?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        messages.reverse();
        Ok(messages)
    }

    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, display_name, google_access_token, google_refresh_token,
                   permissions, usage, created_at, updated_at
            FROM users
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        row.as_ref().map(user_from_row).transpose()
    }

    /// Insert the user or replace the profile fields of an existing record.
    /// Usage counters of an existing record are left to `increment_usage`.
    pub async fn save_user(&self, user: &User) -> Result<()> {
        let (access_token, refresh_token) = match &user.google_credentials {
            Some(c) => (Some(c.access_token.as_str()), c.refresh_token.as_deref()),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO users (user_id, display_name, google_access_token, google_refresh_token,
                               permissions, usage, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                google_access_token = excluded.google_access_token,
                google_refresh_token = excluded.google_refresh_token,
                permissions = excluded.permissions,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.user_id)
        .bind(&user.display_name)
        .bind(access_token)
        .bind(refresh_token)
        .bind(serde_json::to_string(&user.permissions)?)
        .bind(serde_json::to_string(&user.usage)?)
        .bind(user.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;

        Ok(())
    }

    /// Bump usage counters. Unknown users are ignored; returns whether a
    /// record was updated.
    ///
    /// Only the `usage` column is written, and only if it still holds what
    /// was read, so concurrent profile edits and increments are not lost.
    pub async fn increment_usage(&self, user_id: &str, kind: UsageKind, amount: i64) -> Result<bool> {
        for _ in 0..USAGE_RETRIES {
            let Some(raw) = self.load_usage(user_id).await? else {
                return Ok(false);
            };
            let mut usage = serde_json::from_str::<Usage>(&raw).unwrap_or_default();
            usage.increment(kind, amount, Utc::now());
            if self.swap_usage(user_id, &raw, &usage).await? {
                return Ok(true);
            }
        }
        anyhow::bail!("Usage of {} kept changing during update", user_id)
    }

    async fn load_usage(&self, user_id: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT usage FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch usage")
    }

    /// Write `usage` if the column still equals `expected`.
    async fn swap_usage(&self, user_id: &str, expected: &str, usage: &Usage) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users SET usage = ?, updated_at = ?
            WHERE user_id = ? AND usage = ?
            "#,
        )
        .bind(serde_json::to_string(usage)?)
        .bind(Utc::now())
        .bind(user_id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .context("Failed to update usage")?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist a refreshed Google access token.
    pub async fn update_google_access_token(&self, user_id: &str, access_token: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users SET google_access_token = ?, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(access_token)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to update Google access token")?;

        Ok(())
    }
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.try_get("role")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(ChatMessage {
        message_id: row.try_get("message_id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        message_type: row.try_get("message_type")?,
        metadata: serde_json::from_str(&metadata).context("Corrupt message metadata")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let access_token: Option<String> = row.try_get("google_access_token")?;
    let refresh_token: Option<String> = row.try_get("google_refresh_token")?;
    let permissions: String = row.try_get("permissions")?;
    let usage: String = row.try_get("usage")?;

    Ok(User {
        user_id: row.try_get("user_id")?,
        display_name: row.try_get("display_name")?,
        google_credentials: access_token.map(|access_token| GoogleCredentials {
            access_token,
            refresh_token,
        }),
        permissions: serde_json::from_str(&permissions).context("Corrupt permissions column")?,
        usage: serde_json::from_str::<Usage>(&usage).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
