use super::{Seq, Storage};
use crate::chat::{Conversation, Membership, Message};
use crate::entity::{Participant, Role, Tier};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Relational store on SQLite via sqlx. All access is through
/// parameterized queries; uniqueness of (customer, business) pairs is
/// enforced by table constraints.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Capped at one connection so every
    /// query sees the same memory database.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        use sqlx::sqlite::SqlitePoolOptions;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                role TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                business_id TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                last_activity_at DATETIME NOT NULL,
                UNIQUE(customer_id, business_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_activity
                ON conversations(last_activity_at DESC);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sender_role TEXT NOT NULL,
                text TEXT,
                image_url TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS memberships (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                business_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                joined_at DATETIME NOT NULL,
                UNIQUE(customer_id, business_id)
            );

            CREATE TABLE IF NOT EXISTS delivery_cursors (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn pair_column(role: Role) -> &'static str {
        match role {
            Role::Customer => "customer_id",
            Role::Business => "business_id",
        }
    }
}

fn decode_error(msg: String) -> crate::error::Error {
    sqlx::Error::Decode(msg.into()).into()
}

fn role_from_row(row: &SqliteRow, column: &str) -> Result<Role> {
    let raw: String = row.try_get(column).map_err(crate::error::Error::from)?;
    Role::parse(&raw).ok_or_else(|| decode_error(format!("unknown role '{raw}'")))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        business_id: row.try_get("business_id")?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        role: role_from_row(row, "sender_role")?,
        text: row.try_get("text")?,
        image_url: row.try_get("image_url")?,
        read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

fn membership_from_row(row: &SqliteRow) -> Result<Membership> {
    let raw: String = row.try_get("tier")?;
    let tier = Tier::parse(&raw).ok_or_else(|| decode_error(format!("unknown tier '{raw}'")))?;
    Ok(Membership {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        business_id: row.try_get("business_id")?,
        tier,
        joined_at: row.try_get("joined_at")?,
    })
}

#[async_trait]
impl Storage for SqliteStore {
    async fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO participants (id, name, role)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                role = excluded.role
            "#,
        )
        .bind(&participant.id)
        .bind(&participant.name)
        .bind(participant.role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn participant(&self, id: &str) -> Result<Option<Participant>> {
        let row = sqlx::query("SELECT id, name, role FROM participants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Participant {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                role: role_from_row(&row, "role")?,
            })
        })
        .transpose()
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, customer_id, business_id, created_at, last_activity_at \
             FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| conversation_from_row(&row)).transpose()
    }

    async fn find_conversation(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, customer_id, business_id, created_at, last_activity_at \
             FROM conversations WHERE customer_id = ? AND business_id = ?",
        )
        .bind(customer_id)
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| conversation_from_row(&row)).transpose()
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<bool> {
        // A concurrent insert for the same pair loses here with zero rows
        // affected; the caller re-reads the canonical row.
        let result = sqlx::query(
            r#"
            INSERT INTO conversations (id, customer_id, business_id, created_at, last_activity_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(customer_id, business_id) DO NOTHING
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.customer_id)
        .bind(&conversation.business_id)
        .bind(conversation.created_at)
        .bind(conversation.last_activity_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn conversations_for(
        &self,
        participant_id: &str,
        role: Role,
    ) -> Result<Vec<Conversation>> {
        let sql = format!(
            "SELECT id, customer_id, business_id, created_at, last_activity_at \
             FROM conversations WHERE {} = ? ORDER BY last_activity_at DESC",
            Self::pair_column(role)
        );

        let rows = sqlx::query(&sql)
            .bind(participant_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(conversation_from_row).collect()
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE conversations SET last_activity_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> Result<Seq> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, sender_role, text, image_url, is_read, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(message.role.as_str())
        .bind(&message.text)
        .bind(&message.image_url)
        .bind(message.read)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn messages_for(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, sender_role, text, image_url, is_read, created_at \
             FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn last_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, sender_role, text, image_url, is_read, created_at \
             FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, seq DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| message_from_row(&row)).transpose()
    }

    async fn messages_after(&self, after: Seq) -> Result<Vec<(Seq, Message)>> {
        let rows = sqlx::query(
            "SELECT seq, id, conversation_id, sender_id, sender_role, text, image_url, is_read, created_at \
             FROM messages WHERE seq > ? ORDER BY seq ASC",
        )
        .bind(after)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get::<i64, _>("seq")?, message_from_row(row)?)))
            .collect()
    }

    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET is_read = 1 \
             WHERE conversation_id = ? AND sender_id != ? AND is_read = 0",
        )
        .bind(conversation_id)
        .bind(reader_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unread_count(&self, conversation_id: &str, viewer_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages \
             WHERE conversation_id = ? AND sender_id != ? AND is_read = 0",
        )
        .bind(conversation_id)
        .bind(viewer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn membership(&self, id: &str) -> Result<Option<Membership>> {
        let row = sqlx::query(
            "SELECT id, customer_id, business_id, tier, joined_at FROM memberships WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| membership_from_row(&row)).transpose()
    }

    async fn find_membership(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Option<Membership>> {
        let row = sqlx::query(
            "SELECT id, customer_id, business_id, tier, joined_at \
             FROM memberships WHERE customer_id = ? AND business_id = ?",
        )
        .bind(customer_id)
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| membership_from_row(&row)).transpose()
    }

    async fn insert_membership(&self, membership: &Membership) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO memberships (id, customer_id, business_id, tier, joined_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(customer_id, business_id) DO NOTHING
            "#,
        )
        .bind(&membership.id)
        .bind(&membership.customer_id)
        .bind(&membership.business_id)
        .bind(membership.tier.as_str())
        .bind(membership.joined_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn memberships_for(&self, participant_id: &str, role: Role) -> Result<Vec<Membership>> {
        let sql = format!(
            "SELECT id, customer_id, business_id, tier, joined_at \
             FROM memberships WHERE {} = ? ORDER BY joined_at ASC",
            Self::pair_column(role)
        );

        let rows = sqlx::query(&sql)
            .bind(participant_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(membership_from_row).collect()
    }

    async fn set_tier(&self, membership_id: &str, tier: Tier) -> Result<()> {
        sqlx::query("UPDATE memberships SET tier = ? WHERE id = ?")
            .bind(tier.as_str())
            .bind(membership_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_cursor(&self, name: &str) -> Result<Option<Seq>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM delivery_cursors WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn save_cursor(&self, name: &str, value: Seq) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_cursors (name, value)
            VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
