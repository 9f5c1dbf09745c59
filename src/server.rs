//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/login", post(handlers::auth_login))
        .route("/register", post(handlers::auth_register))
        .route("/logout", post(handlers::auth_logout))
        .route("/me", get(handlers::auth_me));

    let api_routes = Router::new()
        .route(
            "/ao3",
            get(handlers::account_get)
                .put(handlers::account_put)
                .delete(handlers::account_delete),
        )
        .route("/share/{kind}", post(handlers::share_set));

    Router::new()
        .route("/", get(handlers::index))
        .route("/feed/{kind}", get(handlers::user_feed))
        .route("/share/{key}", get(handlers::shared_feed))
        .nest("/api/auth", auth_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
