use crate::models::{
    CartItemRow, ConversationListRow, ConversationRow, MessageRow, NegotiationRow, ProductRow,
    ProfileRow, ResolveOutcome, ReviewRow, UserRow,
};
use crate::{now_string, Database};
use anyhow::{anyhow, Result};
use bazaar_types::body::MessageBody;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, email: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, password) VALUES (?1, ?2, ?3)",
                (id, email, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Profiles --

    /// Idempotent: inserts a profile with a derived display name if none
    /// exists, otherwise does nothing. `INSERT OR IGNORE` absorbs the benign
    /// race where two requests create the same profile concurrently.
    pub fn ensure_profile(&self, user_id: &str, email: &str, full_name: Option<&str>) -> Result<()> {
        let name = full_name
            .filter(|n| !n.trim().is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| name_from_email(email));

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO profiles (user_id, full_name, email) VALUES (?1, ?2, ?3)",
                (user_id, &name, email),
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| query_profile(conn, user_id))
    }

    pub fn update_profile(
        &self,
        user_id: &str,
        full_name: Option<&str>,
        phone: Option<&str>,
        is_seller: Option<bool>,
        address: Option<&str>,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE profiles SET
                     full_name = COALESCE(?2, full_name),
                     phone     = COALESCE(?3, phone),
                     is_seller = COALESCE(?4, is_seller),
                     address   = COALESCE(?5, address)
                 WHERE user_id = ?1",
                rusqlite::params![user_id, full_name, phone, is_seller, address],
            )?;
            Ok(updated)
        })
    }

    /// Never fails: profile name, then email local part, then a truncated
    /// identifier placeholder.
    pub fn resolve_display_name(&self, user_id: &str) -> Result<String> {
        self.with_conn(|conn| {
            if let Some(profile) = query_profile(conn, user_id)? {
                return Ok(display_name(
                    Some(&profile.full_name),
                    Some(&profile.email),
                    user_id,
                ));
            }
            let email: Option<String> = conn
                .query_row("SELECT email FROM users WHERE id = ?1", [user_id], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(display_name(None, email.as_deref(), user_id))
        })
    }

    // -- Products --

    pub fn insert_product(
        &self,
        id: &str,
        seller_id: &str,
        name: &str,
        description: Option<&str>,
        price: f64,
        image_url: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO products (id, seller_id, name, description, price, image_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, seller_id, name, description, price, image_url],
            )?;
            Ok(())
        })
    }

    pub fn get_product(&self, id: &str) -> Result<Option<ProductRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, seller_id, name, description, price, image_url, created_at
                 FROM products WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_product).optional()?;
            Ok(row)
        })
    }

    pub fn list_products(&self) -> Result<Vec<ProductRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, seller_id, name, description, price, image_url, created_at
                 FROM products ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt
                .query_map([], map_product)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    /// Look up the unique (buyer, seller, product) triple, creating the
    /// conversation if absent. Losing a concurrent-create race resolves by
    /// re-selecting the winner's row; callers always get the same id for the
    /// same triple.
    pub fn find_or_create_conversation(
        &self,
        id_if_new: &str,
        buyer_id: &str,
        seller_id: &str,
        product_id: Option<&str>,
    ) -> Result<ConversationRow> {
        let now = now_string();
        self.with_conn(|conn| {
            if let Some(row) = query_conversation_by_triple(conn, buyer_id, seller_id, product_id)? {
                return Ok(row);
            }

            match conn.execute(
                "INSERT INTO conversations (id, buyer_id, seller_id, product_id, last_message_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![id_if_new, buyer_id, seller_id, product_id, now],
            ) {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    // Lost the race; the winner's row is selected below.
                }
                Err(e) => return Err(e.into()),
            }

            query_conversation_by_triple(conn, buyer_id, seller_id, product_id)?
                .ok_or_else(|| anyhow!("conversation missing after insert"))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, buyer_id, seller_id, product_id, last_message_at, created_at
                 FROM conversations WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_conversation).optional()?;
            Ok(row)
        })
    }

    /// Conversations the user participates in, joined with the counterpart's
    /// profile and the product, newest activity first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.buyer_id, c.seller_id, c.product_id,
                        p.full_name, COALESCE(p.email, u.email),
                        pr.name, c.last_message_at, c.created_at
                 FROM conversations c
                 LEFT JOIN profiles p
                        ON p.user_id = CASE WHEN c.buyer_id = ?1 THEN c.seller_id ELSE c.buyer_id END
                 LEFT JOIN users u
                        ON u.id = CASE WHEN c.buyer_id = ?1 THEN c.seller_id ELSE c.buyer_id END
                 LEFT JOIN products pr ON pr.id = c.product_id
                 WHERE c.buyer_id = ?1 OR c.seller_id = ?1
                 ORDER BY c.last_message_at DESC, c.rowid DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok((
                        ConversationListRow {
                            id: row.get(0)?,
                            buyer_id: row.get(1)?,
                            seller_id: row.get(2)?,
                            product_id: row.get(3)?,
                            counterpart_name: String::new(),
                            product_name: row.get(6)?,
                            last_message_at: row.get(7)?,
                            created_at: row.get(8)?,
                        },
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(mut row, full_name, email)| {
                    let counterpart_id = if row.buyer_id == user_id {
                        &row.seller_id
                    } else {
                        &row.buyer_id
                    };
                    row.counterpart_name =
                        display_name(full_name.as_deref(), email.as_deref(), counterpart_id);
                    row
                })
                .collect())
        })
    }

    /// Restrict a set of conversation ids to those the user participates in.
    /// Batch membership check for gateway subscriptions.
    pub fn filter_conversations_for_participant(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<Vec<String>> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let placeholders: Vec<String> = (2..=conversation_ids.len() + 1)
                .map(|i| format!("?{}", i))
                .collect();
            let sql = format!(
                "SELECT id FROM conversations
                 WHERE (buyer_id = ?1 OR seller_id = ?1) AND id IN ({})",
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> =
                std::iter::once(&user_id as &dyn rusqlite::types::ToSql)
                    .chain(
                        conversation_ids
                            .iter()
                            .map(|id| id as &dyn rusqlite::types::ToSql),
                    )
                    .collect();
            let rows = stmt
                .query_map(params.as_slice(), |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Append a message and move the parent conversation's last_message_at to
    /// the message's created_at, in one transaction. Returns the timestamp
    /// written.
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        body: &MessageBody,
    ) -> Result<String> {
        let now = now_string();
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            insert_message_tx(&tx, id, conversation_id, sender_id, body, &now)?;
            tx.commit()?;
            Ok(now)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{MESSAGE_SELECT} WHERE m.id = ?1"))?;
            let row = stmt.query_row([id], map_message).optional()?;
            Ok(row.map(finish_message))
        })
    }

    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at ASC, m.rowid ASC"
            ))?;
            let rows = stmt
                .query_map([conversation_id], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(finish_message).collect())
        })
    }

    /// Unread messages addressed to the user across all their conversations,
    /// newest first. Feeds the notification aggregator.
    pub fn unread_messages_for_user(&self, user_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.is_read = 0
                   AND m.sender_id != ?1
                   AND m.conversation_id IN
                       (SELECT id FROM conversations WHERE buyer_id = ?1 OR seller_id = ?1)
                 ORDER BY m.created_at DESC, m.rowid DESC"
            ))?;
            let rows = stmt
                .query_map([user_id], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(finish_message).collect())
        })
    }

    /// unread -> read for every message in the conversation not sent by the
    /// reader. One-way; re-marking is a no-op. Returns rows flipped.
    pub fn mark_conversation_read(&self, conversation_id: &str, reader_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0",
                (conversation_id, reader_id),
            )?;
            Ok(updated)
        })
    }

    /// Bulk: every message addressed to the user becomes read; their own
    /// messages are untouched. Returns rows flipped plus the affected
    /// conversation ids so callers can emit read events per conversation.
    pub fn mark_all_read(&self, user_id: &str) -> Result<(usize, Vec<String>)> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut stmt = tx.prepare(
                "SELECT DISTINCT conversation_id FROM messages
                 WHERE is_read = 0
                   AND sender_id != ?1
                   AND conversation_id IN
                       (SELECT id FROM conversations WHERE buyer_id = ?1 OR seller_id = ?1)",
            )?;
            let conversation_ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            drop(stmt);

            let updated = tx.execute(
                "UPDATE messages SET is_read = 1
                 WHERE is_read = 0
                   AND sender_id != ?1
                   AND conversation_id IN
                       (SELECT id FROM conversations WHERE buyer_id = ?1 OR seller_id = ?1)",
                [user_id],
            )?;
            tx.commit()?;
            Ok((updated, conversation_ids))
        })
    }

    // -- Negotiations --

    pub fn insert_negotiation(
        &self,
        id: &str,
        product_id: &str,
        buyer_id: &str,
        seller_id: &str,
        original_price: f64,
        proposed_price: f64,
        message: Option<&str>,
    ) -> Result<()> {
        let now = now_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO negotiations
                     (id, product_id, buyer_id, seller_id, original_price, proposed_price, message,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                rusqlite::params![
                    id,
                    product_id,
                    buyer_id,
                    seller_id,
                    original_price,
                    proposed_price,
                    message,
                    now
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_negotiation(&self, id: &str) -> Result<Option<NegotiationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{NEGOTIATION_SELECT} WHERE n.id = ?1"))?;
            let row = stmt.query_row([id], map_negotiation).optional()?;
            Ok(row.map(finish_negotiation))
        })
    }

    pub fn list_negotiations_for_user(&self, user_id: &str) -> Result<Vec<NegotiationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{NEGOTIATION_SELECT}
                 WHERE n.buyer_id = ?1 OR n.seller_id = ?1
                 ORDER BY n.created_at DESC, n.rowid DESC"
            ))?;
            let rows = stmt
                .query_map([user_id], map_negotiation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(finish_negotiation).collect())
        })
    }

    /// Pending negotiations awaiting this seller's decision, newest first.
    /// Feeds the notification aggregator.
    pub fn pending_negotiations_for_seller(&self, seller_id: &str) -> Result<Vec<NegotiationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{NEGOTIATION_SELECT}
                 WHERE n.seller_id = ?1 AND n.status = 'pending'
                 ORDER BY n.created_at DESC, n.rowid DESC"
            ))?;
            let rows = stmt
                .query_map([seller_id], map_negotiation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(finish_negotiation).collect())
        })
    }

    /// One-shot pending -> accepted/rejected transition. The status UPDATE is
    /// guarded on `status = 'pending'`, and the synthesized system message is
    /// written in the same transaction, so a resolution produces exactly one
    /// system message and a repeat call produces none. The buyer/seller
    /// conversation for the product is created here if it never existed.
    pub fn resolve_negotiation(
        &self,
        negotiation_id: &str,
        seller_id: &str,
        accept: bool,
        message_id: &str,
        conversation_id_if_new: &str,
    ) -> Result<ResolveOutcome> {
        let now = now_string();
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let neg: Option<(String, String, String, f64)> = tx
                .query_row(
                    "SELECT buyer_id, seller_id, product_id, proposed_price
                     FROM negotiations WHERE id = ?1",
                    [negotiation_id],
                    |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    },
                )
                .optional()?;

            let Some((buyer_id, owner_id, product_id, proposed_price)) = neg else {
                return Ok(ResolveOutcome::NotFound);
            };
            if owner_id != seller_id {
                return Ok(ResolveOutcome::NotSeller);
            }

            let status = if accept { "accepted" } else { "rejected" };
            let updated = tx.execute(
                "UPDATE negotiations SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                (negotiation_id, status, &now),
            )?;
            if updated == 0 {
                return Ok(ResolveOutcome::AlreadyResolved);
            }

            let product_name: String = tx.query_row(
                "SELECT name FROM products WHERE id = ?1",
                [&product_id],
                |row| row.get(0),
            )?;

            let conversation_id = match tx
                .query_row(
                    "SELECT id FROM conversations
                     WHERE buyer_id = ?1 AND seller_id = ?2 AND product_id IS ?3",
                    rusqlite::params![buyer_id, seller_id, product_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            {
                Some(id) => id,
                None => {
                    tx.execute(
                        "INSERT INTO conversations
                             (id, buyer_id, seller_id, product_id, last_message_at, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        rusqlite::params![conversation_id_if_new, buyer_id, seller_id, product_id, now],
                    )?;
                    conversation_id_if_new.to_string()
                }
            };

            let body = MessageBody::System {
                text: format!(
                    "Your offer of ${:.2} for \"{}\" was {}.",
                    proposed_price, product_name, status
                ),
            };
            insert_message_tx(&tx, message_id, &conversation_id, seller_id, &body, &now)?;

            tx.commit()?;
            Ok(ResolveOutcome::Resolved {
                conversation_id,
                system_message_id: message_id.to_string(),
            })
        })
    }

    // -- Reviews --

    /// Returns false when the (product, user) pair already has a review —
    /// the UNIQUE violation is an expected, recoverable outcome.
    pub fn insert_review(
        &self,
        id: &str,
        product_id: &str,
        user_id: &str,
        rating: u8,
        comment: Option<&str>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            match conn.execute(
                "INSERT INTO reviews (id, product_id, user_id, rating, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, product_id, user_id, rating, comment],
            ) {
                Ok(_) => Ok(true),
                Err(e) if is_unique_violation(&e) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn list_reviews(&self, product_id: &str) -> Result<Vec<ReviewRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.product_id, r.user_id,
                        p.full_name, COALESCE(p.email, u.email),
                        r.rating, r.comment, r.created_at
                 FROM reviews r
                 LEFT JOIN profiles p ON p.user_id = r.user_id
                 LEFT JOIN users u ON u.id = r.user_id
                 WHERE r.product_id = ?1
                 ORDER BY r.created_at DESC, r.rowid DESC",
            )?;
            let rows = stmt
                .query_map([product_id], |row| {
                    Ok((
                        ReviewRow {
                            id: row.get(0)?,
                            product_id: row.get(1)?,
                            user_id: row.get(2)?,
                            reviewer_name: String::new(),
                            rating: row.get(5)?,
                            comment: row.get(6)?,
                            created_at: row.get(7)?,
                        },
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(mut row, full_name, email)| {
                    row.reviewer_name =
                        display_name(full_name.as_deref(), email.as_deref(), &row.user_id);
                    row
                })
                .collect())
        })
    }

    // -- Cart --

    /// Adding a product already in the cart adds to its quantity instead of
    /// failing the UNIQUE(user, product) constraint.
    pub fn upsert_cart_item(
        &self,
        id: &str,
        user_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cart_items (id, user_id, product_id, quantity)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, product_id)
                 DO UPDATE SET quantity = quantity + excluded.quantity",
                rusqlite::params![id, user_id, product_id, quantity],
            )?;
            Ok(())
        })
    }

    pub fn list_cart(&self, user_id: &str) -> Result<Vec<CartItemRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.user_id, c.product_id, p.name, p.price, p.image_url, c.quantity
                 FROM cart_items c
                 JOIN products p ON p.id = c.product_id
                 WHERE c.user_id = ?1
                 ORDER BY c.created_at DESC, c.rowid DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(CartItemRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        product_id: row.get(2)?,
                        product_name: row.get(3)?,
                        price: row.get(4)?,
                        image_url: row.get(5)?,
                        quantity: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn remove_cart_item(&self, user_id: &str, product_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM cart_items WHERE user_id = ?1 AND product_id = ?2",
                (user_id, product_id),
            )?;
            Ok(removed)
        })
    }

    pub fn clear_cart(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM cart_items WHERE user_id = ?1", [user_id])?;
            Ok(removed)
        })
    }
}

// -- Shared query text and row mapping --

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id,
        p.full_name, COALESCE(p.email, u.email),
        m.body, m.message_type, m.is_read, m.created_at
 FROM messages m
 LEFT JOIN profiles p ON p.user_id = m.sender_id
 LEFT JOIN users u ON u.id = m.sender_id";

const NEGOTIATION_SELECT: &str = "SELECT n.id, n.product_id, pr.name, n.buyer_id,
        bp.full_name, COALESCE(bp.email, bu.email),
        n.seller_id, n.original_price, n.proposed_price, n.message, n.status,
        n.created_at, n.updated_at
 FROM negotiations n
 JOIN products pr ON pr.id = n.product_id
 LEFT JOIN profiles bp ON bp.user_id = n.buyer_id
 LEFT JOIN users bu ON bu.id = n.buyer_id";

/// Intermediate carrying the joined name columns until display_name runs.
type Raw<T> = (T, Option<String>, Option<String>);

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Raw<MessageRow>> {
    Ok((
        MessageRow {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            sender_name: String::new(),
            body: row.get(5)?,
            message_type: row.get(6)?,
            is_read: row.get(7)?,
            created_at: row.get(8)?,
        },
        row.get(3)?,
        row.get(4)?,
    ))
}

fn finish_message((mut row, full_name, email): Raw<MessageRow>) -> MessageRow {
    row.sender_name = display_name(full_name.as_deref(), email.as_deref(), &row.sender_id);
    row
}

fn map_negotiation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Raw<NegotiationRow>> {
    Ok((
        NegotiationRow {
            id: row.get(0)?,
            product_id: row.get(1)?,
            product_name: row.get(2)?,
            buyer_id: row.get(3)?,
            buyer_name: String::new(),
            seller_id: row.get(6)?,
            original_price: row.get(7)?,
            proposed_price: row.get(8)?,
            message: row.get(9)?,
            status: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        },
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish_negotiation((mut row, full_name, email): Raw<NegotiationRow>) -> NegotiationRow {
    row.buyer_name = display_name(full_name.as_deref(), email.as_deref(), &row.buyer_id);
    row
}

fn map_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProductRow> {
    Ok(ProductRow {
        id: row.get(0)?,
        seller_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        price: row.get(4)?,
        image_url: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        buyer_id: row.get(1)?,
        seller_id: row.get(2)?,
        product_id: row.get(3)?,
        last_message_at: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, email, password, created_at FROM users WHERE {column} = ?1"
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                email: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_profile(conn: &Connection, user_id: &str) -> Result<Option<ProfileRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, full_name, email, phone, is_seller, address, created_at
         FROM profiles WHERE user_id = ?1",
    )?;

    let row = stmt
        .query_row([user_id], |row| {
            Ok(ProfileRow {
                user_id: row.get(0)?,
                full_name: row.get(1)?,
                email: row.get(2)?,
                phone: row.get(3)?,
                is_seller: row.get(4)?,
                address: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_conversation_by_triple(
    conn: &Connection,
    buyer_id: &str,
    seller_id: &str,
    product_id: Option<&str>,
) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, buyer_id, seller_id, product_id, last_message_at, created_at
         FROM conversations
         WHERE buyer_id = ?1 AND seller_id = ?2 AND product_id IS ?3",
    )?;
    let row = stmt
        .query_row(rusqlite::params![buyer_id, seller_id, product_id], map_conversation)
        .optional()?;
    Ok(row)
}

/// Message append shared by direct sends and negotiation resolutions;
/// callers supply the transaction so both writes commit together.
fn insert_message_tx(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    conversation_id: &str,
    sender_id: &str,
    body: &MessageBody,
    created_at: &str,
) -> Result<()> {
    let updated = tx.execute(
        "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
        (conversation_id, created_at),
    )?;
    if updated == 0 {
        return Err(anyhow!("no such conversation: {}", conversation_id));
    }

    tx.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, body, message_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id,
            conversation_id,
            sender_id,
            body.to_stored(),
            body.kind().as_str(),
            created_at
        ],
    )?;
    Ok(())
}

/// Display-name fallback chain: profile name, email local part, truncated id.
pub fn display_name(full_name: Option<&str>, email: Option<&str>, user_id: &str) -> String {
    if let Some(name) = full_name.filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }
    if let Some(email) = email {
        let local = email.split('@').next().unwrap_or("");
        if !local.is_empty() {
            return local.to_string();
        }
    }
    format!("user-{}", &user_id[..user_id.len().min(8)])
}

/// Default profile name derived from the email's local part.
pub fn name_from_email(email: &str) -> String {
    let local = email.split('@').next().unwrap_or("");
    if local.is_empty() {
        email.to_string()
    } else {
        local.to_string()
    }
}

/// Unique-key violations specifically: a foreign-key failure (for example a
/// conversation referencing a nonexistent user) must propagate as a real
/// error, not read as a lost create race.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn uid() -> String {
        Uuid::new_v4().to_string()
    }

    fn db_with_pair() -> (Database, String, String) {
        let db = Database::open_in_memory().unwrap();
        let buyer = uid();
        let seller = uid();
        db.create_user(&buyer, "buyer@example.com", "hash").unwrap();
        db.create_user(&seller, "seller@example.com", "hash").unwrap();
        db.ensure_profile(&buyer, "buyer@example.com", None).unwrap();
        db.ensure_profile(&seller, "seller@example.com", Some("Sana Okafor"))
            .unwrap();
        (db, buyer, seller)
    }

    fn add_product(db: &Database, seller: &str, name: &str, price: f64) -> String {
        let id = uid();
        db.insert_product(&id, seller, name, None, price, None).unwrap();
        id
    }

    fn text(s: &str) -> MessageBody {
        MessageBody::Text { text: s.into() }
    }

    #[test]
    fn ensure_profile_is_idempotent_and_derives_name() {
        let db = Database::open_in_memory().unwrap();
        let user = uid();
        db.create_user(&user, "ama.diallo@example.com", "hash").unwrap();

        db.ensure_profile(&user, "ama.diallo@example.com", None).unwrap();
        db.ensure_profile(&user, "ama.diallo@example.com", None).unwrap();

        let profile = db.get_profile(&user).unwrap().unwrap();
        assert_eq!(profile.full_name, "ama.diallo");
        assert_eq!(db.resolve_display_name(&user).unwrap(), "ama.diallo");
    }

    #[test]
    fn display_name_falls_back_to_placeholder() {
        let db = Database::open_in_memory().unwrap();
        let ghost = "123456789abcdef";
        assert_eq!(db.resolve_display_name(ghost).unwrap(), "user-12345678");
    }

    #[test]
    fn find_or_create_conversation_is_idempotent() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Vintage lamp", 100.0);

        let first = db
            .find_or_create_conversation(&uid(), &buyer, &seller, Some(&product))
            .unwrap();
        let second = db
            .find_or_create_conversation(&uid(), &buyer, &seller, Some(&product))
            .unwrap();
        assert_eq!(first.id, second.id);

        // A different product is a different conversation.
        let other = add_product(&db, &seller, "Desk", 50.0);
        let third = db
            .find_or_create_conversation(&uid(), &buyer, &seller, Some(&other))
            .unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn conversation_without_product_is_its_own_triple() {
        let (db, buyer, seller) = db_with_pair();
        let a = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();
        let b = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn last_message_at_tracks_latest_message() {
        let (db, buyer, seller) = db_with_pair();
        let conv = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();

        let mut last = String::new();
        for i in 0..3 {
            last = db
                .insert_message(&uid(), &conv.id, &buyer, &text(&format!("hi {i}")))
                .unwrap();
        }

        let refreshed = db.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(refreshed.last_message_at, last);

        let messages = db.list_messages(&conv.id).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages.last().unwrap().created_at, last);
    }

    #[test]
    fn messages_list_in_insertion_order_with_sender_names() {
        let (db, buyer, seller) = db_with_pair();
        let conv = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();
        db.insert_message(&uid(), &conv.id, &buyer, &text("first")).unwrap();
        db.insert_message(&uid(), &conv.id, &seller, &text("second")).unwrap();

        let messages = db.list_messages(&conv.id).unwrap();
        let bodies: Vec<_> = messages
            .iter()
            .map(|m| MessageBody::from_stored(&m.message_type, &m.body).preview())
            .collect();
        assert_eq!(bodies, vec!["first", "second"]);
        assert_eq!(messages[0].sender_name, "buyer");
        assert_eq!(messages[1].sender_name, "Sana Okafor");
    }

    #[test]
    fn mark_conversation_read_only_touches_incoming() {
        let (db, buyer, seller) = db_with_pair();
        let conv = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();
        db.insert_message(&uid(), &conv.id, &buyer, &text("from buyer")).unwrap();
        db.insert_message(&uid(), &conv.id, &seller, &text("from seller")).unwrap();

        let flipped = db.mark_conversation_read(&conv.id, &buyer).unwrap();
        assert_eq!(flipped, 1);

        for m in db.list_messages(&conv.id).unwrap() {
            if m.sender_id == seller {
                assert!(m.is_read);
            } else {
                assert!(!m.is_read, "buyer's own message must stay unread");
            }
        }

        // One-way: marking again flips nothing.
        assert_eq!(db.mark_conversation_read(&conv.id, &buyer).unwrap(), 0);
    }

    #[test]
    fn mark_all_read_spans_conversations_but_not_own_messages() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Desk", 50.0);
        let c1 = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();
        let c2 = db
            .find_or_create_conversation(&uid(), &buyer, &seller, Some(&product))
            .unwrap();
        db.insert_message(&uid(), &c1.id, &seller, &text("a")).unwrap();
        db.insert_message(&uid(), &c2.id, &seller, &text("b")).unwrap();
        db.insert_message(&uid(), &c2.id, &buyer, &text("mine")).unwrap();

        let (updated, mut touched) = db.mark_all_read(&buyer).unwrap();
        assert_eq!(updated, 2);
        touched.sort();
        let mut expected = vec![c1.id.clone(), c2.id.clone()];
        expected.sort();
        assert_eq!(touched, expected);
        assert!(db.unread_messages_for_user(&buyer).unwrap().is_empty());

        // The buyer's own message is still unread from the seller's side.
        let seller_unread = db.unread_messages_for_user(&seller).unwrap();
        assert_eq!(seller_unread.len(), 1);
        assert_eq!(seller_unread[0].sender_id, buyer);

        // Nothing left to flip, so no conversations are reported either.
        assert_eq!(db.mark_all_read(&buyer).unwrap(), (0, vec![]));
    }

    #[test]
    fn find_or_create_conversation_rejects_unknown_users() {
        let db = Database::open_in_memory().unwrap();
        // Neither participant exists; the foreign key must surface as an
        // error rather than read as a lost create race.
        let result = db.find_or_create_conversation(&uid(), &uid(), &uid(), None);
        assert!(result.is_err());
    }

    #[test]
    fn participant_filter_drops_foreign_conversations() {
        let (db, buyer, seller) = db_with_pair();
        let outsider = uid();
        db.create_user(&outsider, "lurker@example.com", "hash").unwrap();
        let conv = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();

        let requested = vec![conv.id.clone(), uid()];
        assert_eq!(
            db.filter_conversations_for_participant(&buyer, &requested).unwrap(),
            vec![conv.id.clone()]
        );
        assert_eq!(
            db.filter_conversations_for_participant(&seller, &requested).unwrap(),
            vec![conv.id.clone()]
        );
        // A non-participant keeps nothing, even with a real conversation id.
        assert!(db
            .filter_conversations_for_participant(&outsider, &requested)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn list_conversations_orders_by_activity_and_resolves_names() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Vintage lamp", 100.0);
        let older = db
            .find_or_create_conversation(&uid(), &buyer, &seller, None)
            .unwrap();
        let newer = db
            .find_or_create_conversation(&uid(), &buyer, &seller, Some(&product))
            .unwrap();
        db.insert_message(&uid(), &older.id, &buyer, &text("x")).unwrap();
        db.insert_message(&uid(), &newer.id, &buyer, &text("y")).unwrap();

        let listed = db.list_conversations(&buyer).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[0].counterpart_name, "Sana Okafor");
        assert_eq!(listed[0].product_name.as_deref(), Some("Vintage lamp"));

        // Seller sees the buyer's derived name.
        let from_seller = db.list_conversations(&seller).unwrap();
        assert_eq!(from_seller[0].counterpart_name, "buyer");
    }

    #[test]
    fn accept_negotiation_synthesizes_one_system_message() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Vintage lamp", 100.0);
        let neg = uid();
        db.insert_negotiation(&neg, &product, &buyer, &seller, 100.0, 80.0, Some("deal?"))
            .unwrap();

        let outcome = db
            .resolve_negotiation(&neg, &seller, true, &uid(), &uid())
            .unwrap();
        let conversation_id = match outcome {
            ResolveOutcome::Resolved {
                conversation_id, ..
            } => conversation_id,
            _ => panic!("expected Resolved"),
        };

        let row = db.get_negotiation(&neg).unwrap().unwrap();
        assert_eq!(row.status, "accepted");

        let messages = db.list_messages(&conversation_id).unwrap();
        let system: Vec<_> = messages
            .iter()
            .filter(|m| m.message_type == "system")
            .collect();
        assert_eq!(system.len(), 1);
        let body = MessageBody::from_stored("system", &system[0].body);
        let preview = body.preview();
        assert!(preview.contains("$80"), "got: {preview}");
        assert!(preview.contains("accepted"), "got: {preview}");
        assert!(preview.contains("Vintage lamp"), "got: {preview}");
    }

    #[test]
    fn resolve_is_one_shot() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Desk", 60.0);
        let neg = uid();
        db.insert_negotiation(&neg, &product, &buyer, &seller, 60.0, 45.0, None)
            .unwrap();

        let first = db
            .resolve_negotiation(&neg, &seller, false, &uid(), &uid())
            .unwrap();
        let conversation_id = match first {
            ResolveOutcome::Resolved {
                conversation_id, ..
            } => conversation_id,
            _ => panic!("expected Resolved"),
        };

        // Second resolve (either decision) is rejected and writes nothing.
        assert!(matches!(
            db.resolve_negotiation(&neg, &seller, true, &uid(), &uid()).unwrap(),
            ResolveOutcome::AlreadyResolved
        ));
        assert_eq!(db.get_negotiation(&neg).unwrap().unwrap().status, "rejected");

        let system_count = db
            .list_messages(&conversation_id)
            .unwrap()
            .iter()
            .filter(|m| m.message_type == "system")
            .count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn resolve_reuses_existing_conversation() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Desk", 60.0);
        let existing = db
            .find_or_create_conversation(&uid(), &buyer, &seller, Some(&product))
            .unwrap();

        let neg = uid();
        db.insert_negotiation(&neg, &product, &buyer, &seller, 60.0, 50.0, None)
            .unwrap();
        let outcome = db
            .resolve_negotiation(&neg, &seller, true, &uid(), &uid())
            .unwrap();
        match outcome {
            ResolveOutcome::Resolved {
                conversation_id, ..
            } => assert_eq!(conversation_id, existing.id),
            _ => panic!("expected Resolved"),
        }
    }

    #[test]
    fn resolve_rejects_non_seller() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Desk", 60.0);
        let neg = uid();
        db.insert_negotiation(&neg, &product, &buyer, &seller, 60.0, 50.0, None)
            .unwrap();

        assert!(matches!(
            db.resolve_negotiation(&neg, &buyer, true, &uid(), &uid()).unwrap(),
            ResolveOutcome::NotSeller
        ));
        assert!(matches!(
            db.resolve_negotiation(&uid(), &seller, true, &uid(), &uid()).unwrap(),
            ResolveOutcome::NotFound
        ));
        assert_eq!(db.get_negotiation(&neg).unwrap().unwrap().status, "pending");
    }

    #[test]
    fn duplicate_review_is_recoverable() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Desk", 60.0);

        assert!(db.insert_review(&uid(), &product, &buyer, 5, Some("great")).unwrap());
        assert!(!db.insert_review(&uid(), &product, &buyer, 3, None).unwrap());
        assert_eq!(db.list_reviews(&product).unwrap().len(), 1);
    }

    #[test]
    fn cart_conflict_adds_quantities() {
        let (db, buyer, seller) = db_with_pair();
        let product = add_product(&db, &seller, "Desk", 60.0);

        db.upsert_cart_item(&uid(), &buyer, &product, 1).unwrap();
        db.upsert_cart_item(&uid(), &buyer, &product, 2).unwrap();

        let cart = db.list_cart(&buyer).unwrap();
        assert_eq!(cart.len(), 1);
        assert_eq!(cart[0].quantity, 3);

        assert_eq!(db.remove_cart_item(&buyer, &product).unwrap(), 1);
        assert!(db.list_cart(&buyer).unwrap().is_empty());
    }
}
