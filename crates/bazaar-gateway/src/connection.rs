use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use bazaar_db::Database;
use bazaar_types::api::Claims;
use bazaar_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection. The client must Identify with a JWT
/// within 10 seconds, then receives Ready and the event stream for the
/// conversations it Subscribes to (targeted events arrive regardless).
/// Subscribe requests are checked against the database: only conversations
/// where the user is the buyer or the seller are honored.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    jwt_secret: String,
    db: Arc<Database>,
) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, email) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", email, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        email: email.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Register the targeted channel and subscribe to broadcasts
    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;
    let mut broadcast_rx = dispatcher.subscribe();
    let dispatcher_recv = dispatcher.clone();

    // Per-connection conversation subscriptions (shared between tasks)
    let subscribed: Arc<std::sync::RwLock<HashSet<Uuid>>> =
        Arc::new(std::sync::RwLock::new(HashSet::new()));
    let send_subscriptions = subscribed.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if let Some(conversation_id) = event.conversation_id() {
                        let subs = send_subscriptions.read()
                            .expect("subscription lock poisoned");
                        if !subs.contains(&conversation_id) {
                            continue;
                        }
                    }

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let email_recv = email.clone();
    let recv_subscriptions = subscribed.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &dispatcher_recv,
                            &db,
                            user_id,
                            &email_recv,
                            cmd,
                            &recv_subscriptions,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            email_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_user_channel(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", email, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{decode, DecodingKey, Validation};

    let timeout = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.email));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: Uuid,
    email: &str,
    cmd: GatewayCommand,
    subscriptions: &Arc<std::sync::RwLock<HashSet<Uuid>>>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { conversation_ids } => {
            let allowed = authorized_subscriptions(db, user_id, conversation_ids).await;
            info!(
                "{} ({}) subscribed to {} conversations",
                email,
                user_id,
                allowed.len()
            );
            {
                let mut subs = subscriptions.write().expect("subscription lock poisoned");
                *subs = allowed.iter().copied().collect();
            }
            dispatcher.set_subscriptions(user_id, allowed).await;
        }
    }
}

/// Participant-only visibility applies to the event stream the same as to
/// the REST surface: keep only the requested conversations where the user is
/// the buyer or the seller. A membership-check failure subscribes to nothing.
async fn authorized_subscriptions(
    db: &Arc<Database>,
    user_id: Uuid,
    requested: Vec<Uuid>,
) -> Vec<Uuid> {
    if requested.is_empty() {
        return Vec::new();
    }

    let db = db.clone();
    let uid = user_id.to_string();
    let ids: Vec<String> = requested.iter().map(Uuid::to_string).collect();
    let member = tokio::task::spawn_blocking(move || {
        db.filter_conversations_for_participant(&uid, &ids)
    })
    .await;

    let member = match member {
        Ok(Ok(ids)) => ids,
        Ok(Err(e)) => {
            warn!("{} subscription membership check failed: {:#}", user_id, e);
            return Vec::new();
        }
        Err(e) => {
            warn!("{} subscription membership check panicked: {}", user_id, e);
            return Vec::new();
        }
    };

    let dropped = requested.len() - member.len();
    if dropped > 0 {
        warn!(
            "{} requested {} conversations, dropped {} they do not participate in",
            user_id,
            requested.len(),
            dropped
        );
    }

    member.iter().filter_map(|id| id.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_conversation(db: &Database) -> (Uuid, Uuid, Uuid) {
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        db.create_user(&buyer.to_string(), "buyer@example.com", "hash")
            .unwrap();
        db.create_user(&seller.to_string(), "seller@example.com", "hash")
            .unwrap();
        let conv = db
            .find_or_create_conversation(
                &Uuid::new_v4().to_string(),
                &buyer.to_string(),
                &seller.to_string(),
                None,
            )
            .unwrap();
        (buyer, seller, conv.id.parse().unwrap())
    }

    #[tokio::test]
    async fn participants_keep_their_subscriptions() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (buyer, seller, conv) = seed_conversation(&db);

        assert_eq!(authorized_subscriptions(&db, buyer, vec![conv]).await, vec![conv]);
        assert_eq!(authorized_subscriptions(&db, seller, vec![conv]).await, vec![conv]);
    }

    #[tokio::test]
    async fn outsiders_cannot_subscribe_to_a_conversation_they_know_the_id_of() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (_, _, conv) = seed_conversation(&db);

        let outsider = Uuid::new_v4();
        db.create_user(&outsider.to_string(), "lurker@example.com", "hash")
            .unwrap();

        assert!(authorized_subscriptions(&db, outsider, vec![conv]).await.is_empty());

        // End to end through the dispatcher: the outsider never registers the
        // subscription, so conversation-scoped broadcasts stay invisible.
        let dispatcher = Dispatcher::new();
        let allowed = authorized_subscriptions(&db, outsider, vec![conv]).await;
        dispatcher.set_subscriptions(outsider, allowed).await;
        assert!(!dispatcher.is_subscribed(outsider, conv).await);
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_from_subscription_requests() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (buyer, _, conv) = seed_conversation(&db);

        let kept =
            authorized_subscriptions(&db, buyer, vec![conv, Uuid::new_v4()]).await;
        assert_eq!(kept, vec![conv]);
    }
}
