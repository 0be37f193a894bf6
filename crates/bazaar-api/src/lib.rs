pub mod auth;
pub mod cart;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod negotiations;
pub mod notifications;
pub mod products;
pub mod profiles;
pub mod reviews;

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;

use tracing::{error, warn};
use uuid::Uuid;

/// Run a blocking storage closure off the async runtime.
pub(crate) async fn blocking<T, F>(state: AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&bazaar_db::Database) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state.db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("task join error"))
        })?
}

/// Parse a stored uuid, degrading to the nil uuid on corrupt data rather
/// than failing a whole listing.
pub(crate) fn parse_uuid(raw: &str, context: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", context, raw, e);
        Uuid::default()
    })
}
