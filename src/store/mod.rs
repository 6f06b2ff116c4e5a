mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::chat::{Conversation, Membership, Message};
use crate::entity::{Participant, Role, Tier};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Monotonic position in the message log, assigned by the store on insert.
/// The poll-based delivery worker scans forward from its last-seen sequence.
pub type Seq = i64;

/// Storage behind the conversation directory, message store, and
/// membership ledger. Two implementations: [`SqliteStore`] for production
/// and [`MemoryStore`] for tests, selected at construction time.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upsert_participant(&self, participant: &Participant) -> Result<()>;
    async fn participant(&self, id: &str) -> Result<Option<Participant>>;

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>>;
    async fn find_conversation(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Option<Conversation>>;
    /// Insert-if-absent. Returns `false` when the (customer, business) pair
    /// already has a conversation; callers resolve the race by re-reading.
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<bool>;
    /// Conversations where `participant_id` plays `role`, most recently
    /// active first.
    async fn conversations_for(
        &self,
        participant_id: &str,
        role: Role,
    ) -> Result<Vec<Conversation>>;
    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn insert_message(&self, message: &Message) -> Result<Seq>;
    /// All messages of a conversation, ascending by creation time. UI
    /// threading depends on this ordering.
    async fn messages_for(&self, conversation_id: &str) -> Result<Vec<Message>>;
    async fn last_message(&self, conversation_id: &str) -> Result<Option<Message>>;
    /// Log tail beyond `after`, ascending by sequence. Feeds the poll worker.
    async fn messages_after(&self, after: Seq) -> Result<Vec<(Seq, Message)>>;
    /// Flip read=true on every message in the conversation NOT sent by
    /// `reader_id`. Idempotent.
    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<()>;
    /// Count of unread messages in the conversation authored by someone
    /// other than `viewer_id`. Derived, never stored.
    async fn unread_count(&self, conversation_id: &str, viewer_id: &str) -> Result<i64>;

    async fn membership(&self, id: &str) -> Result<Option<Membership>>;
    async fn find_membership(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Option<Membership>>;
    /// Insert-if-absent, same contract as [`Storage::insert_conversation`].
    async fn insert_membership(&self, membership: &Membership) -> Result<bool>;
    async fn memberships_for(&self, participant_id: &str, role: Role) -> Result<Vec<Membership>>;
    async fn set_tier(&self, membership_id: &str, tier: Tier) -> Result<()>;

    async fn load_cursor(&self, name: &str) -> Result<Option<Seq>>;
    async fn save_cursor(&self, name: &str, value: Seq) -> Result<()>;
}
