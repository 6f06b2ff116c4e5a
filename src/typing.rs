use crate::bus::{ChannelEvent, ChannelRegistry};
use crate::entity::Role;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Ephemeral typing-presence state, one slot per (conversation, role).
///
/// Idle -> Typing on the first keystroke, which broadcasts a start signal.
/// Every further keystroke resets the inactivity timer. Timer expiry, a
/// message send, or an explicit stop returns the slot to Idle and
/// broadcasts exactly one stop signal. Nothing here is persisted; a
/// subscriber joining mid-state waits for the next transition.
pub struct TypingTracker {
    channels: Arc<ChannelRegistry>,
    timeout: Duration,
    timers: Mutex<HashMap<(String, Role), JoinHandle<()>>>,
}

impl TypingTracker {
    pub fn new(channels: Arc<ChannelRegistry>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            channels,
            timeout,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Record composing activity for `role` in the conversation.
    pub fn keystroke(self: &Arc<Self>, conversation_id: &str, role: Role) {
        let key = (conversation_id.to_string(), role);
        let mut timers = self.timers.lock().unwrap();

        let was_typing = match timers.remove(&key) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        };

        if !was_typing {
            self.channels.publish(
                conversation_id,
                ChannelEvent::Typing {
                    conversation_id: conversation_id.to_string(),
                    role,
                    typing: true,
                },
            );
        }

        let tracker = Arc::clone(self);
        let conversation = conversation_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(tracker.timeout).await;
            tracker.expire(&conversation, role);
        });
        timers.insert(key, timer);
    }

    /// Explicit Typing -> Idle transition (blur or message send).
    /// A no-op when the slot is already idle, so a send right after the
    /// timer expired cannot emit a duplicate stop.
    pub fn stop(&self, conversation_id: &str, role: Role) {
        let key = (conversation_id.to_string(), role);
        let removed = {
            let mut timers = self.timers.lock().unwrap();
            timers.remove(&key)
        };

        if let Some(timer) = removed {
            timer.abort();
            self.broadcast_stop(conversation_id, role);
        }
    }

    fn expire(&self, conversation_id: &str, role: Role) {
        let key = (conversation_id.to_string(), role);
        let removed = {
            let mut timers = self.timers.lock().unwrap();
            timers.remove(&key)
        };

        if removed.is_some() {
            self.broadcast_stop(conversation_id, role);
        }
    }

    fn broadcast_stop(&self, conversation_id: &str, role: Role) {
        self.channels.publish(
            conversation_id,
            ChannelEvent::Typing {
                conversation_id: conversation_id.to_string(),
                role,
                typing: false,
            },
        );
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        let timers = self.timers.lock().unwrap();
        for timer in timers.values() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn typing_flag(event: ChannelEvent) -> (Role, bool) {
        match event {
            ChannelEvent::Typing { role, typing, .. } => (role, typing),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_yields_exactly_one_stop() {
        let channels = Arc::new(ChannelRegistry::new());
        let tracker = TypingTracker::new(channels.clone(), Duration::from_secs(2));
        let mut rx = channels.subscribe("conv-1");

        tracker.keystroke("conv-1", Role::Customer);
        assert_eq!(typing_flag(rx.try_recv().unwrap()), (Role::Customer, true));

        // Repeated keystrokes are still one typing burst: no extra start.
        tracker.keystroke("conv-1", Role::Customer);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // Paused clock advances once everything is idle, firing the timer.
        assert_eq!(typing_flag(rx.recv().await.unwrap()), (Role::Customer, false));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn send_before_timeout_stops_immediately_without_duplicate() {
        let channels = Arc::new(ChannelRegistry::new());
        let tracker = TypingTracker::new(channels.clone(), Duration::from_secs(2));
        let mut rx = channels.subscribe("conv-1");

        tracker.keystroke("conv-1", Role::Customer);
        assert_eq!(typing_flag(rx.try_recv().unwrap()), (Role::Customer, true));

        tracker.stop("conv-1", Role::Customer);
        assert_eq!(typing_flag(rx.try_recv().unwrap()), (Role::Customer, false));

        // The aborted timer must not produce a second stop.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_is_a_no_op() {
        let channels = Arc::new(ChannelRegistry::new());
        let tracker = TypingTracker::new(channels.clone(), Duration::from_secs(2));
        let mut rx = channels.subscribe("conv-1");

        tracker.stop("conv-1", Role::Customer);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn sides_track_state_independently() {
        let channels = Arc::new(ChannelRegistry::new());
        let tracker = TypingTracker::new(channels.clone(), Duration::from_secs(2));
        let mut rx = channels.subscribe("conv-1");

        tracker.keystroke("conv-1", Role::Customer);
        tracker.keystroke("conv-1", Role::Business);
        assert_eq!(typing_flag(rx.try_recv().unwrap()), (Role::Customer, true));
        assert_eq!(typing_flag(rx.try_recv().unwrap()), (Role::Business, true));

        tracker.stop("conv-1", Role::Business);
        assert_eq!(typing_flag(rx.try_recv().unwrap()), (Role::Business, false));

        // The customer's timer is still pending and expires on its own.
        assert_eq!(typing_flag(rx.recv().await.unwrap()), (Role::Customer, false));
    }
}