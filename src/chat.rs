use crate::entity::{Role, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unique thread between one customer and one business.
///
/// At most one conversation exists per (customer, business) pair; the
/// directory enforces this with an insert-if-absent. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub customer_id: String,
    pub business_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(customer_id: impl Into<String>, business_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            customer_id: customer_id.into(),
            business_id: business_id.into(),
            created_at: now,
            last_activity_at: now,
        }
    }

    /// The role `participant_id` plays in this conversation, or `None`
    /// if they are not a participant at all.
    pub fn role_of(&self, participant_id: &str) -> Option<Role> {
        if self.customer_id == participant_id {
            Some(Role::Customer)
        } else if self.business_id == participant_id {
            Some(Role::Business)
        } else {
            None
        }
    }

    pub fn counterpart_of(&self, participant_id: &str) -> Option<&str> {
        match self.role_of(participant_id)? {
            Role::Customer => Some(&self.business_id),
            Role::Business => Some(&self.customer_id),
        }
    }
}

/// A single message within a conversation.
///
/// Immutable once created, except for the read flag which only ever
/// transitions false -> true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub role: Role,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        role: Role,
        text: Option<String>,
        image_url: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            role,
            text,
            image_url,
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// A customer's tiered relationship with a specific business.
/// Created on first engagement at the lowest tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: String,
    pub customer_id: String,
    pub business_id: String,
    pub tier: Tier,
    pub joined_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(customer_id: impl Into<String>, business_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            customer_id: customer_id.into(),
            business_id: business_id.into(),
            tier: Tier::Bronze,
            joined_at: Utc::now(),
        }
    }
}

/// Thread-list projection returned by `GET /conversations`: one row per
/// conversation from the viewer's perspective, with a derived unread count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub counterpart_id: String,
    pub counterpart_name: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_knows_its_participants() {
        let conv = Conversation::new("cust-1", "biz-1");
        assert_eq!(conv.role_of("cust-1"), Some(Role::Customer));
        assert_eq!(conv.role_of("biz-1"), Some(Role::Business));
        assert_eq!(conv.role_of("stranger"), None);
        assert_eq!(conv.counterpart_of("cust-1"), Some("biz-1"));
        assert_eq!(conv.counterpart_of("biz-1"), Some("cust-1"));
        assert_eq!(conv.counterpart_of("stranger"), None);
    }

    #[test]
    fn new_message_starts_unread() {
        let msg = Message::new("conv-1", "cust-1", Role::Customer, Some("hi".into()), None);
        assert!(!msg.read);
        assert_eq!(msg.text.as_deref(), Some("hi"));
    }

    #[test]
    fn new_membership_starts_at_bronze() {
        let m = Membership::new("cust-1", "biz-1");
        assert_eq!(m.tier, Tier::Bronze);
    }
}
