use axum::{extract::State, response::IntoResponse, Extension, Json};

use bazaar_db::models::{MessageRow, NegotiationRow};
use bazaar_db::parse_timestamp;
use bazaar_types::api::{
    Claims, NotificationFeed, NotificationKind, NotificationResponse,
};
use bazaar_types::body::MessageBody;

use crate::error::ApiError;
use crate::{parse_uuid, AppState};

/// Derived feed: unread incoming messages plus pending negotiations awaiting
/// the user as seller. Nothing is stored; every call recomputes from the
/// current snapshots, so there is no cache to drift.
pub async fn get_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (messages, negotiations) = crate::blocking(state, move |db| {
        let user_id = claims.sub.to_string();
        let messages = db.unread_messages_for_user(&user_id)?;
        let negotiations = db.pending_negotiations_for_seller(&user_id)?;
        Ok((messages, negotiations))
    })
    .await?;

    Ok(Json(compute_feed(messages, negotiations)))
}

/// Pure aggregation over the two snapshots, sorted non-increasing by
/// creation time.
fn compute_feed(messages: Vec<MessageRow>, negotiations: Vec<NegotiationRow>) -> NotificationFeed {
    let mut notifications: Vec<NotificationResponse> = Vec::new();

    for row in messages {
        // System messages are negotiation outcomes; surface them under the
        // negotiation tag so the UI groups them with offers.
        let kind = if row.message_type == "system" {
            NotificationKind::Negotiation
        } else {
            NotificationKind::Message
        };
        let body = MessageBody::from_stored(&row.message_type, &row.body);
        notifications.push(NotificationResponse {
            id: parse_uuid(&row.id, "message id"),
            kind,
            title: row.sender_name,
            detail: body.preview(),
            conversation_id: Some(parse_uuid(&row.conversation_id, "conversation_id")),
            negotiation_id: None,
            is_read: row.is_read,
            created_at: parse_timestamp(&row.created_at),
        });
    }

    for row in negotiations {
        notifications.push(NotificationResponse {
            id: parse_uuid(&row.id, "negotiation id"),
            kind: NotificationKind::Negotiation,
            title: format!("Offer from {}", row.buyer_name),
            detail: format!("${:.2} for {}", row.proposed_price, row.product_name),
            conversation_id: None,
            negotiation_id: Some(parse_uuid(&row.id, "negotiation id")),
            // Pending negotiations have no read flag; they count as unread
            // until resolved.
            is_read: false,
            created_at: parse_timestamp(&row.created_at),
        });
    }

    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let unread_count = notifications.iter().filter(|n| !n.is_read).count();

    NotificationFeed {
        notifications,
        unread_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message(kind: &str, created_at: &str) -> MessageRow {
        MessageRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: Uuid::new_v4().to_string(),
            sender_id: Uuid::new_v4().to_string(),
            sender_name: "Sana".into(),
            body: MessageBody::Text {
                text: "hello".into(),
            }
            .to_stored(),
            message_type: kind.into(),
            is_read: false,
            created_at: created_at.into(),
        }
    }

    fn negotiation(created_at: &str) -> NegotiationRow {
        NegotiationRow {
            id: Uuid::new_v4().to_string(),
            product_id: Uuid::new_v4().to_string(),
            product_name: "Vintage lamp".into(),
            buyer_id: Uuid::new_v4().to_string(),
            buyer_name: "buyer".into(),
            seller_id: Uuid::new_v4().to_string(),
            original_price: 100.0,
            proposed_price: 80.0,
            message: None,
            status: "pending".into(),
            created_at: created_at.into(),
            updated_at: created_at.into(),
        }
    }

    #[test]
    fn feed_is_sorted_non_increasing_and_counts_unread() {
        let feed = compute_feed(
            vec![
                message("text", "2026-03-01T10:00:00Z"),
                message("text", "2026-03-01T12:00:00Z"),
            ],
            vec![negotiation("2026-03-01T11:00:00Z")],
        );

        assert_eq!(feed.notifications.len(), 3);
        assert!(feed
            .notifications
            .windows(2)
            .all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(
            feed.unread_count,
            feed.notifications.iter().filter(|n| !n.is_read).count()
        );
        assert_eq!(feed.unread_count, 3);
    }

    #[test]
    fn system_messages_surface_as_negotiation_kind() {
        let feed = compute_feed(vec![message("system", "2026-03-01T10:00:00Z")], vec![]);
        assert_eq!(feed.notifications[0].kind, NotificationKind::Negotiation);
        assert!(feed.notifications[0].conversation_id.is_some());
    }

    #[test]
    fn pending_negotiations_are_always_unread() {
        let feed = compute_feed(vec![], vec![negotiation("2026-03-01T10:00:00Z")]);
        assert!(!feed.notifications[0].is_read);
        assert_eq!(feed.unread_count, 1);
        assert_eq!(feed.notifications[0].detail, "$80.00 for Vintage lamp");
    }

    #[test]
    fn empty_snapshots_produce_empty_feed() {
        let feed = compute_feed(vec![], vec![]);
        assert!(feed.notifications.is_empty());
        assert_eq!(feed.unread_count, 0);
    }
}
