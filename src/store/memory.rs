use super::{Seq, Storage};
use crate::chat::{Conversation, Membership, Message};
use crate::entity::{Participant, Role, Tier};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory implementation of [`Storage`], used by tests and as the
/// shared append log behind the poll-based delivery channel in examples.
/// Same contracts as the relational store, no durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    participants: HashMap<String, Participant>,
    conversations: Vec<Conversation>,
    messages: Vec<(Seq, Message)>,
    memberships: Vec<Membership>,
    cursors: HashMap<String, Seq>,
    next_seq: Seq,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .participants
            .insert(participant.id.clone(), participant.clone());
        Ok(())
    }

    async fn participant(&self, id: &str) -> Result<Option<Participant>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.participants.get(id).cloned())
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn find_conversation(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Option<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.customer_id == customer_id && c.business_id == business_id)
            .cloned())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let exists = inner.conversations.iter().any(|c| {
            c.customer_id == conversation.customer_id && c.business_id == conversation.business_id
        });
        if exists {
            return Ok(false);
        }
        inner.conversations.push(conversation.clone());
        Ok(true)
    }

    async fn conversations_for(
        &self,
        participant_id: &str,
        role: Role,
    ) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Conversation> = inner
            .conversations
            .iter()
            .filter(|c| match role {
                Role::Customer => c.customer_id == participant_id,
                Role::Business => c.business_id == participant_id,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(out)
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conv) = inner.conversations.iter_mut().find(|c| c.id == id) {
            conv.last_activity_at = at;
        }
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> Result<Seq> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.messages.push((seq, message.clone()));
        Ok(seq)
    }

    async fn messages_for(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Message> = inner
            .messages
            .iter()
            .filter(|(_, m)| m.conversation_id == conversation_id)
            .map(|(_, m)| m.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn last_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        Ok(self.messages_for(conversation_id).await?.pop())
    }

    async fn messages_after(&self, after: Seq) -> Result<Vec<(Seq, Message)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|(seq, _)| *seq > after)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for (_, msg) in inner.messages.iter_mut() {
            if msg.conversation_id == conversation_id && msg.sender_id != reader_id {
                msg.read = true;
            }
        }
        Ok(())
    }

    async fn unread_count(&self, conversation_id: &str, viewer_id: &str) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        let count = inner
            .messages
            .iter()
            .filter(|(_, m)| {
                m.conversation_id == conversation_id && m.sender_id != viewer_id && !m.read
            })
            .count();
        Ok(count as i64)
    }

    async fn membership(&self, id: &str) -> Result<Option<Membership>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.memberships.iter().find(|m| m.id == id).cloned())
    }

    async fn find_membership(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Option<Membership>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .memberships
            .iter()
            .find(|m| m.customer_id == customer_id && m.business_id == business_id)
            .cloned())
    }

    async fn insert_membership(&self, membership: &Membership) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let exists = inner.memberships.iter().any(|m| {
            m.customer_id == membership.customer_id && m.business_id == membership.business_id
        });
        if exists {
            return Ok(false);
        }
        inner.memberships.push(membership.clone());
        Ok(true)
    }

    async fn memberships_for(&self, participant_id: &str, role: Role) -> Result<Vec<Membership>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .memberships
            .iter()
            .filter(|m| match role {
                Role::Customer => m.customer_id == participant_id,
                Role::Business => m.business_id == participant_id,
            })
            .cloned()
            .collect())
    }

    async fn set_tier(&self, membership_id: &str, tier: Tier) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.memberships.iter_mut().find(|m| m.id == membership_id) {
            m.tier = tier;
        }
        Ok(())
    }

    async fn load_cursor(&self, name: &str) -> Result<Option<Seq>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.cursors.get(name).copied())
    }

    async fn save_cursor(&self, name: &str, value: Seq) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.cursors.insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn behaves_like_the_relational_store_for_pair_uniqueness() {
        let store = MemoryStore::new();
        let conv = Conversation::new("cust-1", "biz-1");
        assert!(store.insert_conversation(&conv).await.unwrap());
        assert!(!store
            .insert_conversation(&Conversation::new("cust-1", "biz-1"))
            .await
            .unwrap());
        assert!(store
            .insert_conversation(&Conversation::new("cust-1", "biz-2"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn listing_orders_by_last_activity_descending() {
        let store = MemoryStore::new();
        let older = Conversation::new("cust-1", "biz-1");
        let newer = Conversation::new("cust-1", "biz-2");
        store.insert_conversation(&older).await.unwrap();
        store.insert_conversation(&newer).await.unwrap();

        store
            .touch_conversation(&older.id, Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let list = store.conversations_for("cust-1", Role::Customer).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, older.id);
    }
}
