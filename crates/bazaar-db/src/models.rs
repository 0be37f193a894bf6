/// Database row types — these map directly to SQLite rows.
/// Distinct from bazaar-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password: String,
    pub created_at: String,
}

pub struct ProfileRow {
    pub user_id: String,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub is_seller: bool,
    pub address: Option<String>,
    pub created_at: String,
}

pub struct ProductRow {
    pub id: String,
    pub seller_id: String,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub image_url: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub product_id: Option<String>,
    pub last_message_at: String,
    pub created_at: String,
}

/// Conversation joined with the requesting user's counterpart and product,
/// as returned by `list_conversations`.
pub struct ConversationListRow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub product_id: Option<String>,
    pub counterpart_name: String,
    pub product_name: Option<String>,
    pub last_message_at: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub message_type: String,
    pub is_read: bool,
    pub created_at: String,
}

pub struct NegotiationRow {
    pub id: String,
    pub product_id: String,
    pub product_name: String,
    pub buyer_id: String,
    pub buyer_name: String,
    pub seller_id: String,
    pub original_price: f64,
    pub proposed_price: f64,
    pub message: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ReviewRow {
    pub id: String,
    pub product_id: String,
    pub user_id: String,
    pub reviewer_name: String,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: String,
}

pub struct CartItemRow {
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub product_name: String,
    pub price: f64,
    pub image_url: Option<String>,
    pub quantity: u32,
}

/// Outcome of a negotiation resolution attempt. `Resolved` carries the
/// conversation the synthesized system message landed in.
pub enum ResolveOutcome {
    Resolved {
        conversation_id: String,
        system_message_id: String,
    },
    AlreadyResolved,
    NotSeller,
    NotFound,
}
