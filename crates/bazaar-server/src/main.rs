use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use bazaar_api::middleware::require_auth;
use bazaar_api::{auth, cart, conversations, messages, negotiations, notifications, products, profiles, reviews};
use bazaar_api::{AppState, AppStateInner};
use bazaar_gateway::connection;
use bazaar_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
    db: Arc<bazaar_db::Database>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bazaar=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("BAZAAR_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("BAZAAR_DB_PATH").unwrap_or_else(|_| "bazaar.db".into());
    let host = std::env::var("BAZAAR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("BAZAAR_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(bazaar_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
        dispatcher: dispatcher.clone(),
    });

    let ws_state = ServerState {
        dispatcher,
        jwt_secret,
        db,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/products", get(products::list_products))
        .route("/products/{product_id}", get(products::get_product))
        .route("/products/{product_id}/reviews", get(reviews::list_reviews))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/profile", get(profiles::get_me))
        .route("/profile", put(profiles::update_me))
        .route("/products", post(products::create_product))
        .route("/products/{product_id}/reviews", post(reviews::create_review))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations", post(conversations::start_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::list_messages),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(messages::send_message),
        )
        .route("/messages/read-all", post(messages::mark_all_read))
        .route("/negotiations", get(negotiations::list_negotiations))
        .route("/negotiations", post(negotiations::propose_price))
        .route(
            "/negotiations/{negotiation_id}/resolve",
            post(negotiations::resolve_negotiation),
        )
        .route("/notifications", get(notifications::get_notifications))
        .route("/cart", get(cart::list_items))
        .route("/cart", post(cart::add_item))
        .route("/cart", delete(cart::clear))
        .route("/cart/{product_id}", delete(cart::remove_item))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(ws_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Bazaar server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.jwt_secret, state.db)
    })
}
