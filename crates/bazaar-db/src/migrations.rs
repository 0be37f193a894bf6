use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            email       TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS profiles (
            user_id     TEXT PRIMARY KEY REFERENCES users(id),
            full_name   TEXT NOT NULL,
            email       TEXT NOT NULL,
            phone       TEXT,
            is_seller   INTEGER NOT NULL DEFAULT 0,
            address     TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS products (
            id          TEXT PRIMARY KEY,
            seller_id   TEXT NOT NULL REFERENCES users(id),
            name        TEXT NOT NULL,
            description TEXT,
            price       REAL NOT NULL,
            image_url   TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_products_seller
            ON products(seller_id);

        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            buyer_id        TEXT NOT NULL REFERENCES users(id),
            seller_id       TEXT NOT NULL REFERENCES users(id),
            product_id      TEXT REFERENCES products(id),
            last_message_at TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            UNIQUE(buyer_id, seller_id, product_id)
        );

        -- UNIQUE treats NULLs as distinct; product-less conversations need
        -- their own uniqueness guarantee.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_no_product
            ON conversations(buyer_id, seller_id) WHERE product_id IS NULL;

        CREATE INDEX IF NOT EXISTS idx_conversations_buyer
            ON conversations(buyer_id, last_message_at);
        CREATE INDEX IF NOT EXISTS idx_conversations_seller
            ON conversations(seller_id, last_message_at);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            body            TEXT NOT NULL,
            message_type    TEXT NOT NULL DEFAULT 'text'
                            CHECK (message_type IN ('text', 'product_mention', 'system')),
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(is_read, sender_id);

        CREATE TABLE IF NOT EXISTS negotiations (
            id              TEXT PRIMARY KEY,
            product_id      TEXT NOT NULL REFERENCES products(id),
            buyer_id        TEXT NOT NULL REFERENCES users(id),
            seller_id       TEXT NOT NULL REFERENCES users(id),
            original_price  REAL NOT NULL,
            proposed_price  REAL NOT NULL,
            message         TEXT,
            status          TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'accepted', 'rejected')),
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_negotiations_seller
            ON negotiations(seller_id, status);
        CREATE INDEX IF NOT EXISTS idx_negotiations_buyer
            ON negotiations(buyer_id);

        CREATE TABLE IF NOT EXISTS reviews (
            id          TEXT PRIMARY KEY,
            product_id  TEXT NOT NULL REFERENCES products(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            rating      INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
            comment     TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(product_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS cart_items (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            product_id  TEXT NOT NULL REFERENCES products(id),
            quantity    INTEGER NOT NULL CHECK (quantity > 0),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_id, product_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
