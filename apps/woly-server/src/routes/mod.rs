pub mod admin;
pub mod auth;
pub mod capabilities;
pub mod health;
pub mod hosts;
pub mod nodes;
pub mod schedules;
pub mod webhooks;
pub mod ws;

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::state::AppState;

fn api_router() -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .merge(capabilities::router())
        .merge(nodes::router())
        .merge(hosts::router())
        .merge(hosts::scan_router())
        .merge(schedules::router())
        .merge(webhooks::router())
        .merge(admin::router())
}

/// Router without rate limiting; unit tests exercise this shape.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(ws::router())
        .nest("/api", api_router())
        .with_state(state)
}

/// Production router: strict limits on token exchange and scan triggers; the
/// moderate general limit is layered in `main` alongside CORS.
pub fn rate_limited_router(state: AppState) -> Result<Router> {
    // Token exchange: ~5 requests per 15 minutes per IP.
    let token_governor = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(180))
            .burst_size(5)
            .use_headers()
            .finish()
            .context("failed to build token-exchange rate limiter")?,
    );
    // Scan: one trigger per 30 seconds with a burst of two.
    let scan_governor = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(30))
            .burst_size(2)
            .use_headers()
            .finish()
            .context("failed to build scan rate limiter")?,
    );

    let api = Router::new()
        .merge(auth::router().layer(GovernorLayer::new(token_governor)))
        .merge(capabilities::router())
        .merge(nodes::router())
        .merge(hosts::router())
        .merge(hosts::scan_router().layer(GovernorLayer::new(scan_governor)))
        .merge(schedules::router())
        .merge(webhooks::router())
        .merge(admin::router());

    Ok(Router::new()
        .merge(health::router())
        .merge(ws::router())
        .nest("/api", api)
        .with_state(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn protected_routes_reject_anonymous_requests() {
        let state = crate::test_support::test_state().await;
        for uri in [
            "/api/capabilities",
            "/api/nodes",
            "/api/hosts",
            "/api/schedules",
            "/api/webhooks",
            "/api/admin/stats",
        ] {
            let app = router(state.clone());
            let resp = app
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }
}
