use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

use bazaar_types::events::GatewayEvent;

/// Manages connected clients and routes events to them.
///
/// Two delivery paths: a broadcast channel carrying conversation-scoped
/// events (each connection filters by its subscription set), and per-user
/// targeted channels for events a client must see regardless of what it is
/// subscribed to (negotiations, notification refreshes).
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for conversation-scoped events
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Per-user targeted send channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,

    /// Per-user conversation subscriptions, mirrored from the connections so
    /// publishers can tell whether a targeted copy is needed
    subscriptions: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the broadcast stream. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients (they filter by scope).
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a per-user targeted channel. Returns (conn_id, receiver).
    /// A newer connection for the same user replaces the older one.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister a per-user channel, but only if conn_id still owns it.
    /// Idempotent: repeat calls and calls for never-registered users are
    /// no-ops.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id) {
            if *stored_conn_id == conn_id {
                channels.remove(&user_id);
                self.inner.subscriptions.write().await.remove(&user_id);
            }
        }
    }

    /// Send a targeted event to a specific user. Silently dropped if the
    /// user has no live connection.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let channels = self.inner.user_channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            let _ = tx.send(event);
        }
    }

    /// Replace the set of conversations a user's connection listens to.
    pub async fn set_subscriptions(&self, user_id: Uuid, conversation_ids: Vec<Uuid>) {
        self.inner
            .subscriptions
            .write()
            .await
            .insert(user_id, conversation_ids.into_iter().collect());
    }

    pub async fn is_subscribed(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        self.inner
            .subscriptions
            .read()
            .await
            .get(&user_id)
            .map_or(false, |set| set.contains(&conversation_id))
    }

    /// Deliver a conversation-scoped event: broadcast for subscribers, plus a
    /// targeted copy to each listed participant that is NOT subscribed to the
    /// conversation (so their notification feed still refreshes) — never both.
    pub async fn publish_to_conversation(
        &self,
        conversation_id: Uuid,
        participants: &[Uuid],
        event: GatewayEvent,
    ) {
        for &user_id in participants {
            if !self.is_subscribed(user_id, conversation_id).await {
                self.send_to_user(user_id, event.clone()).await;
            }
        }
        self.broadcast(event);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event(event: GatewayEvent) -> (Uuid, Uuid) {
        match event {
            GatewayEvent::MessagesRead {
                conversation_id,
                reader_id,
            } => (conversation_id, reader_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn sample(conversation_id: Uuid, reader_id: Uuid) -> GatewayEvent {
        GatewayEvent::MessagesRead {
            conversation_id,
            reader_id,
        }
    }

    #[tokio::test]
    async fn targeted_delivery_reaches_registered_user() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_, mut rx) = dispatcher.register_user_channel(user).await;

        let conv = Uuid::new_v4();
        dispatcher.send_to_user(user, sample(conv, user)).await;
        let (got_conv, _) = read_event(rx.recv().await.unwrap());
        assert_eq!(got_conv, conv);
    }

    #[tokio::test]
    async fn publish_skips_targeted_copy_for_subscribed_participants() {
        let dispatcher = Dispatcher::new();
        let subscribed = Uuid::new_v4();
        let idle = Uuid::new_v4();
        let conv = Uuid::new_v4();

        let (_, mut sub_rx) = dispatcher.register_user_channel(subscribed).await;
        let (_, mut idle_rx) = dispatcher.register_user_channel(idle).await;
        dispatcher.set_subscriptions(subscribed, vec![conv]).await;

        let mut broadcast_rx = dispatcher.subscribe();
        dispatcher
            .publish_to_conversation(conv, &[subscribed, idle], sample(conv, subscribed))
            .await;

        // Subscribed participant gets the broadcast copy only.
        assert!(broadcast_rx.recv().await.is_ok());
        assert!(sub_rx.try_recv().is_err());

        // Unsubscribed participant gets the targeted copy.
        let (got_conv, _) = read_event(idle_rx.recv().await.unwrap());
        assert_eq!(got_conv, conv);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_conn_guarded() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        // Never registered: no-op.
        dispatcher.unregister_user_channel(user, Uuid::new_v4()).await;

        let (old_conn, _old_rx) = dispatcher.register_user_channel(user).await;
        let (new_conn, mut new_rx) = dispatcher.register_user_channel(user).await;

        // The stale connection's cleanup must not tear down the new channel.
        dispatcher.unregister_user_channel(user, old_conn).await;
        let conv = Uuid::new_v4();
        dispatcher.send_to_user(user, sample(conv, user)).await;
        assert!(new_rx.recv().await.is_some());

        dispatcher.unregister_user_channel(user, new_conn).await;
        dispatcher.unregister_user_channel(user, new_conn).await;
        dispatcher.send_to_user(user, sample(conv, user)).await; // dropped, no panic
    }

    #[tokio::test]
    async fn subscriptions_are_replaced_wholesale() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        dispatcher.set_subscriptions(user, vec![a]).await;
        assert!(dispatcher.is_subscribed(user, a).await);

        dispatcher.set_subscriptions(user, vec![b]).await;
        assert!(!dispatcher.is_subscribed(user, a).await);
        assert!(dispatcher.is_subscribed(user, b).await);
    }
}
