use crate::bus::{ChannelEvent, ChannelRegistry};
use crate::chat::{Conversation, ConversationSummary, Membership, Message};
use crate::config::DeliveryMode;
use crate::entity::{Identity, Participant, Role, Tier};
use crate::error::{Error, Result};
use crate::store::Storage;
use crate::typing::TypingTracker;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Orchestrates the conversation directory, message store, delivery
/// channel, typing presence, and read receipts behind the HTTP surface.
#[derive(Clone)]
pub struct Messenger {
    store: Arc<dyn Storage>,
    channels: Arc<ChannelRegistry>,
    typing: Arc<TypingTracker>,
    delivery: DeliveryMode,
}

impl Messenger {
    pub fn new(
        store: Arc<dyn Storage>,
        channels: Arc<ChannelRegistry>,
        typing: Arc<TypingTracker>,
        delivery: DeliveryMode,
    ) -> Self {
        Self {
            store,
            channels,
            typing,
            delivery,
        }
    }

    /// Idempotent directory lookup: at most one conversation per
    /// (customer, business) pair. A lost insert race is resolved by
    /// re-reading the canonical row, never surfaced as an error.
    ///
    /// First engagement also opens a membership at the lowest tier.
    pub async fn get_or_create_conversation(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Conversation> {
        self.ensure_membership(customer_id, business_id).await?;

        if let Some(existing) = self.store.find_conversation(customer_id, business_id).await? {
            return Ok(existing);
        }

        let candidate = Conversation::new(customer_id, business_id);
        if self.store.insert_conversation(&candidate).await? {
            info!("created conversation {} ({customer_id} <-> {business_id})", candidate.id);
            return Ok(candidate);
        }

        // Lost the race to a concurrent insert; the canonical row exists now.
        self.store
            .find_conversation(customer_id, business_id)
            .await?
            .ok_or(Error::NotFound("conversation"))
    }

    /// Thread list for the viewer, most recently active first, with the
    /// last message preview and a derived unread count per thread.
    pub async fn threads_for(&self, viewer: &Identity) -> Result<Vec<ConversationSummary>> {
        let conversations = self.store.conversations_for(&viewer.id, viewer.role).await?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let counterpart_id = conversation
                .counterpart_of(&viewer.id)
                .ok_or(Error::NotFound("conversation"))?
                .to_string();

            let counterpart_name = match self.store.participant(&counterpart_id).await? {
                Some(p) => p.name,
                None => counterpart_id.clone(),
            };

            let last = self.store.last_message(&conversation.id).await?;
            let unread_count = self.store.unread_count(&conversation.id, &viewer.id).await?;

            summaries.push(ConversationSummary {
                conversation_id: conversation.id,
                counterpart_id,
                counterpart_name,
                last_message: last.as_ref().and_then(|m| {
                    m.text
                        .clone()
                        .or_else(|| m.image_url.as_ref().map(|_| "[image]".to_string()))
                }),
                last_message_at: last.map(|m| m.created_at),
                unread_count,
            });
        }

        Ok(summaries)
    }

    /// The conversation, checked to exist and to include the viewer.
    pub async fn conversation_for(&self, id: &str, viewer: &Identity) -> Result<Conversation> {
        let conversation = self
            .store
            .conversation(id)
            .await?
            .ok_or(Error::NotFound("conversation"))?;

        match conversation.role_of(&viewer.id) {
            Some(role) if role == viewer.role => Ok(conversation),
            _ => Err(Error::Forbidden("not a participant of this conversation")),
        }
    }

    /// Full message history, ascending by creation time.
    pub async fn history(&self, conversation_id: &str, viewer: &Identity) -> Result<Vec<Message>> {
        self.conversation_for(conversation_id, viewer).await?;
        self.store.messages_for(conversation_id).await
    }

    /// Append a message and notify the conversation's live subscribers.
    /// At least one of `text` and `image_url` must be present.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender: &Identity,
        text: Option<String>,
        image_url: Option<String>,
    ) -> Result<Message> {
        let text = text.filter(|t| !t.trim().is_empty());
        if text.is_none() && image_url.is_none() {
            return Err(Error::validation("message requires text or an image"));
        }

        self.conversation_for(conversation_id, sender).await?;

        let message = Message::new(conversation_id, &sender.id, sender.role, text, image_url);
        self.store.insert_message(&message).await?;
        self.store
            .touch_conversation(conversation_id, message.created_at)
            .await?;

        // Sending ends the sender's typing burst.
        self.typing.stop(conversation_id, sender.role);

        // In poll mode the worker picks the message up from the log tail
        // instead; publishing here would deliver it twice.
        if self.delivery == DeliveryMode::Push {
            self.channels
                .publish(conversation_id, ChannelEvent::Message(message.clone()));
        }

        Ok(message)
    }

    /// Read receipt: the viewer opened the conversation, so every message
    /// from the counterpart becomes read. Idempotent.
    pub async fn conversation_opened(&self, conversation_id: &str, viewer: &Identity) -> Result<()> {
        self.conversation_for(conversation_id, viewer).await?;
        self.store.mark_read(conversation_id, &viewer.id).await
    }

    pub async fn unread_count(&self, conversation_id: &str, viewer: &Identity) -> Result<i64> {
        self.conversation_for(conversation_id, viewer).await?;
        self.store.unread_count(conversation_id, &viewer.id).await
    }

    /// Composing-state signal from the viewer. `typing == false` is an
    /// explicit stop (blur).
    pub async fn set_typing(&self, conversation_id: &str, viewer: &Identity, typing: bool) -> Result<()> {
        self.conversation_for(conversation_id, viewer).await?;
        if typing {
            self.typing.keystroke(conversation_id, viewer.role);
        } else {
            self.typing.stop(conversation_id, viewer.role);
        }
        Ok(())
    }

    /// Live event feed for a conversation the viewer participates in.
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        viewer: &Identity,
    ) -> Result<tokio::sync::broadcast::Receiver<ChannelEvent>> {
        self.conversation_for(conversation_id, viewer).await?;
        Ok(self.channels.subscribe(conversation_id))
    }

    pub async fn upsert_profile(&self, identity: &Identity, name: String) -> Result<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("name must not be empty"));
        }
        self.store
            .upsert_participant(&Participant {
                id: identity.id.clone(),
                name,
                role: identity.role,
            })
            .await
    }

    pub async fn memberships_for(&self, viewer: &Identity) -> Result<Vec<Membership>> {
        self.store.memberships_for(&viewer.id, viewer.role).await
    }

    /// Get-or-create a membership at the lowest tier, same race handling
    /// as the conversation directory.
    pub async fn ensure_membership(
        &self,
        customer_id: &str,
        business_id: &str,
    ) -> Result<Membership> {
        if let Some(existing) = self.store.find_membership(customer_id, business_id).await? {
            return Ok(existing);
        }

        let candidate = Membership::new(customer_id, business_id);
        if self.store.insert_membership(&candidate).await? {
            return Ok(candidate);
        }

        self.store
            .find_membership(customer_id, business_id)
            .await?
            .ok_or(Error::NotFound("membership"))
    }

    /// Business-initiated tier assignment. Any tier may replace any other.
    pub async fn assign_tier(
        &self,
        membership_id: &str,
        business: &Identity,
        tier: Tier,
    ) -> Result<Membership> {
        if business.role != Role::Business {
            return Err(Error::Forbidden("only businesses assign tiers"));
        }

        let membership = self
            .store
            .membership(membership_id)
            .await?
            .ok_or(Error::NotFound("membership"))?;

        if membership.business_id != business.id {
            return Err(Error::Forbidden("membership belongs to another business"));
        }

        self.store.set_tier(membership_id, tier).await?;
        info!("membership {membership_id} set to tier {tier}");
        Ok(Membership { tier, ..membership })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn messenger(delivery: DeliveryMode) -> Messenger {
        let store = Arc::new(MemoryStore::new());
        let channels = Arc::new(ChannelRegistry::new());
        let typing = TypingTracker::new(channels.clone(), Duration::from_secs(2));
        Messenger::new(store, channels, typing, delivery)
    }

    fn customer() -> Identity {
        Identity::new("cust-1", Role::Customer)
    }

    fn business() -> Identity {
        Identity::new("biz-1", Role::Business)
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_conversation() {
        let messenger = messenger(DeliveryMode::Push);

        let (a, b, c) = tokio::join!(
            messenger.get_or_create_conversation("cust-1", "biz-1"),
            messenger.get_or_create_conversation("cust-1", "biz-1"),
            messenger.get_or_create_conversation("cust-1", "biz-1"),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(a.id, b.id);
        assert_eq!(b.id, c.id);
    }

    #[tokio::test]
    async fn first_engagement_opens_a_bronze_membership() {
        let messenger = messenger(DeliveryMode::Push);
        messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        let memberships = messenger.memberships_for(&customer()).await.unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].tier, Tier::Bronze);
        assert_eq!(memberships[0].business_id, "biz-1");
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let messenger = messenger(DeliveryMode::Push);
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        let err = messenger
            .send_message(&conv.id, &customer(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = messenger
            .send_message(&conv.id, &customer(), Some("   ".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn image_only_message_passes_validation() {
        let messenger = messenger(DeliveryMode::Push);
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        let msg = messenger
            .send_message(
                &conv.id,
                &business(),
                None,
                Some("https://cdn.example/receipt.png".into()),
            )
            .await
            .unwrap();

        assert!(msg.text.is_none());
        assert_eq!(msg.image_url.as_deref(), Some("https://cdn.example/receipt.png"));
    }

    #[tokio::test]
    async fn first_message_scenario() {
        let messenger = messenger(DeliveryMode::Push);

        // Customer sends "Hello" with no prior conversation.
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();
        messenger
            .send_message(&conv.id, &customer(), Some("Hello".into()), None)
            .await
            .unwrap();

        let history = messenger.history(&conv.id, &customer()).await.unwrap();
        assert_eq!(history.len(), 1);

        assert_eq!(messenger.unread_count(&conv.id, &business()).await.unwrap(), 1);
        assert_eq!(messenger.unread_count(&conv.id, &customer()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn opening_the_thread_flips_only_counterpart_flags() {
        let messenger = messenger(DeliveryMode::Push);
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        messenger
            .send_message(&conv.id, &customer(), Some("Hello".into()), None)
            .await
            .unwrap();
        messenger
            .send_message(&conv.id, &business(), None, Some("https://cdn.example/a.png".into()))
            .await
            .unwrap();

        messenger.conversation_opened(&conv.id, &customer()).await.unwrap();
        messenger.conversation_opened(&conv.id, &customer()).await.unwrap();

        let history = messenger.history(&conv.id, &customer()).await.unwrap();
        let own = history.iter().find(|m| m.role == Role::Customer).unwrap();
        let theirs = history.iter().find(|m| m.role == Role::Business).unwrap();
        assert!(!own.read);
        assert!(theirs.read);

        assert_eq!(messenger.unread_count(&conv.id, &customer()).await.unwrap(), 0);
        assert_eq!(messenger.unread_count(&conv.id, &business()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn push_mode_delivers_to_live_subscribers() {
        let messenger = messenger(DeliveryMode::Push);
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        let mut rx = messenger.subscribe(&conv.id, &business()).await.unwrap();

        let sent = messenger
            .send_message(&conv.id, &customer(), Some("ping".into()), None)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ChannelEvent::Message(delivered) => assert_eq!(delivered.id, sent.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_mode_send_path_does_not_publish() {
        let messenger = messenger(DeliveryMode::Poll);
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        let mut rx = messenger.subscribe(&conv.id, &business()).await.unwrap();
        messenger
            .send_message(&conv.id, &customer(), Some("ping".into()), None)
            .await
            .unwrap();

        // Delivery belongs to the poll worker in this mode.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sending_ends_the_typing_burst() {
        let messenger = messenger(DeliveryMode::Push);
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        let mut rx = messenger.subscribe(&conv.id, &business()).await.unwrap();

        messenger.set_typing(&conv.id, &customer(), true).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ChannelEvent::Typing { typing: true, .. }
        ));

        messenger
            .send_message(&conv.id, &customer(), Some("done".into()), None)
            .await
            .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            ChannelEvent::Typing { typing: false, .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), ChannelEvent::Message(_)));

        // The aborted inactivity timer stays silent afterwards.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outsiders_cannot_read_or_write_a_thread() {
        let messenger = messenger(DeliveryMode::Push);
        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();

        let outsider = Identity::new("cust-2", Role::Customer);
        assert!(matches!(
            messenger.history(&conv.id, &outsider).await.unwrap_err(),
            Error::Forbidden(_)
        ));
        assert!(matches!(
            messenger
                .send_message(&conv.id, &outsider, Some("hi".into()), None)
                .await
                .unwrap_err(),
            Error::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let messenger = messenger(DeliveryMode::Push);
        let err = messenger
            .history("missing", &customer())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn tier_assignment_is_business_only_and_scoped() {
        let messenger = messenger(DeliveryMode::Push);
        let membership = messenger.ensure_membership("cust-1", "biz-1").await.unwrap();

        let err = messenger
            .assign_tier(&membership.id, &customer(), Tier::Vip)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let other_business = Identity::new("biz-2", Role::Business);
        let err = messenger
            .assign_tier(&membership.id, &other_business, Tier::Vip)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let updated = messenger
            .assign_tier(&membership.id, &business(), Tier::Vip)
            .await
            .unwrap();
        assert_eq!(updated.tier, Tier::Vip);

        let reloaded = messenger.memberships_for(&business()).await.unwrap();
        assert_eq!(reloaded[0].tier, Tier::Vip);
    }

    #[tokio::test]
    async fn thread_list_carries_preview_and_unread_count() {
        let messenger = messenger(DeliveryMode::Push);
        messenger
            .upsert_profile(&business(), "Atelier Nova".into())
            .await
            .unwrap();

        let conv = messenger
            .get_or_create_conversation("cust-1", "biz-1")
            .await
            .unwrap();
        messenger
            .send_message(&conv.id, &business(), Some("Welcome!".into()), None)
            .await
            .unwrap();

        let threads = messenger.threads_for(&customer()).await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].counterpart_id, "biz-1");
        assert_eq!(threads[0].counterpart_name, "Atelier Nova");
        assert_eq!(threads[0].last_message.as_deref(), Some("Welcome!"));
        assert_eq!(threads[0].unread_count, 1);

        messenger.conversation_opened(&conv.id, &customer()).await.unwrap();
        let threads = messenger.threads_for(&customer()).await.unwrap();
        assert_eq!(threads[0].unread_count, 0);
    }
}
