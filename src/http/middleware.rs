//! axum middleware that puts routes behind the admission engine.
//!
//! ```ignore
//! let login = RateLimit::fixed(engine.clone(), resolver.clone(), "login");
//! let app = Router::new()
//!     .route("/login", post(login_handler))
//!     .layer(axum::middleware::from_fn_with_state(login, enforce));
//! ```
//!
//! The peer address is read from `ConnectInfo<SocketAddr>`, so serve the
//! router with `into_make_service_with_connect_info::<SocketAddr>()`.
//! Authenticated callers are recognized through an [`AuthenticatedUser`]
//! request extension set by an earlier layer.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header::USER_AGENT, HeaderMap, Method, Uri};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;

use super::response::{denied, is_api_request, write_headers};
use crate::ratelimit::{
    Actor, AdmissionEngine, AuthenticatedUser, Decision, IdentifierResolver, RequestContext,
    TierSelector,
};

#[derive(Debug, Clone)]
enum ActionSelector {
    Fixed(Arc<str>),
    Tiered(TierSelector),
}

/// Middleware state: the engine, how callers are identified, and which
/// action a request counts against.
#[derive(Clone)]
pub struct RateLimit {
    engine: AdmissionEngine,
    resolver: Arc<IdentifierResolver>,
    selector: ActionSelector,
}

impl RateLimit {
    /// Count every request against `action`.
    pub fn fixed(
        engine: AdmissionEngine,
        resolver: Arc<IdentifierResolver>,
        action: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            engine,
            resolver,
            selector: ActionSelector::Fixed(action.into()),
        }
    }

    /// Pick the action per request from the caller's role and the path.
    pub fn tiered(engine: AdmissionEngine, resolver: Arc<IdentifierResolver>) -> Self {
        Self {
            engine,
            resolver,
            selector: ActionSelector::Tiered(TierSelector),
        }
    }

    pub fn engine(&self) -> &AdmissionEngine {
        &self.engine
    }

    fn action_for(&self, user: Option<&AuthenticatedUser>, path: &str) -> String {
        match &self.selector {
            ActionSelector::Fixed(action) => action.to_string(),
            ActionSelector::Tiered(selector) => selector.select(user, path).to_string(),
        }
    }

    /// Describe the check for a request, with the action picked by this
    /// layer's selector.
    pub fn admission(&self, parts: &RequestParts<'_>) -> Admission {
        let action = self.action_for(parts.user, parts.uri.path());
        self.admission_for(action, parts)
    }

    /// Describe the check for a request against an explicit action.
    pub fn admission_for(&self, action: String, parts: &RequestParts<'_>) -> Admission {
        let actor = self.resolver.resolve_actor(
            parts.user.map(|u| u.user_id.as_str()),
            parts.headers,
            parts.peer.map(|addr| addr.ip()),
        );

        Admission {
            context: parts.context(&actor),
            identifier: actor.identifier,
            action,
            is_api: is_api_request(parts.headers, parts.uri),
        }
    }

    pub async fn admit(&self, admission: &Admission) -> Decision {
        self.engine
            .admit_request(&admission.identifier, &admission.action, &admission.context)
            .await
    }
}

/// An owned, ready-to-run admission check.
///
/// Built from borrowed request parts before any await point so that the
/// request itself is not held across the store round-trip.
#[derive(Debug, Clone)]
pub struct Admission {
    pub identifier: String,
    pub action: String,
    pub context: RequestContext,
    /// Whether a denial should be answered with JSON
    pub is_api: bool,
}

/// The pieces of a request the admission check reads.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub user: Option<&'a AuthenticatedUser>,
    pub headers: &'a HeaderMap,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub peer: Option<SocketAddr>,
}

impl<'a> RequestParts<'a> {
    pub fn from_request(request: &'a Request) -> Self {
        Self {
            user: request.extensions().get::<AuthenticatedUser>(),
            headers: request.headers(),
            method: request.method(),
            uri: request.uri(),
            peer: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }

    fn context(&self, actor: &Actor) -> RequestContext {
        RequestContext {
            source_ip: actor.client_ip.clone(),
            user_agent: self
                .headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            endpoint: self
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| self.uri.path().to_string()),
            method: self.method.as_str().to_string(),
        }
    }
}

/// Admit the request or answer 429 before it reaches the handler.
///
/// Admitted responses get the rate limit headers added on the way out.
pub async fn enforce(State(limit): State<RateLimit>, request: Request, next: Next) -> Response {
    let admission = limit.admission(&RequestParts::from_request(&request));
    let decision = limit.admit(&admission).await;

    if !decision.allowed {
        return denied(&decision, admission.is_api);
    }

    let mut response = next.run(request).await;
    write_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Policy, PolicyRegistry, Reaper};
    use crate::store::MemoryEventStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::middleware::from_fn_with_state;
    use axum::routing::{get, post};
    use axum::Router;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn engine(store: Arc<MemoryEventStore>, entries: &[(&str, u64, u64)]) -> AdmissionEngine {
        let table: HashMap<String, Policy> = entries
            .iter()
            .map(|(a, m, w)| (a.to_string(), Policy::new(*m, *w).unwrap()))
            .collect();
        AdmissionEngine::new(store, Arc::new(PolicyRegistry::new(table).unwrap()))
            .with_clock(Arc::new(ManualClock::new(1_000)))
            .with_reaper(Reaper::disabled())
    }

    fn login_request(ip: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header("x-real-ip", ip)
            .header("user-agent", "test-agent")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_fixed_action_limits_route() {
        let store = Arc::new(MemoryEventStore::new());
        let limit = RateLimit::fixed(
            engine(store.clone(), &[("login", 2, 60)]),
            Arc::new(IdentifierResolver::default()),
            "login",
        );
        let app = Router::new()
            .route("/login", post(|| async { "welcome" }))
            .layer(from_fn_with_state(limit, enforce));

        let first = app.clone().oneshot(login_request("10.0.0.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

        let second = app.clone().oneshot(login_request("10.0.0.1")).await.unwrap();
        assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

        let third = app.clone().oneshot(login_request("10.0.0.1")).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(third.headers().contains_key("retry-after"));

        let other = app.oneshot(login_request("10.0.0.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);

        let events = store.events_for("ip_10.0.0.1", "login");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].method, "POST");
        assert_eq!(events[0].endpoint, "/login");
        assert_eq!(events[0].user_agent, "test-agent");
        assert_eq!(events[0].source_ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_tiered_action_uses_authenticated_user() {
        let store = Arc::new(MemoryEventStore::new());
        let limit = RateLimit::tiered(
            engine(store.clone(), &[("search", 1, 60), ("api_strict", 1, 60)]),
            Arc::new(IdentifierResolver::default()),
        );
        let app = Router::new()
            .route("/api/search", get(|| async { "results" }))
            .layer(from_fn_with_state(limit, enforce));

        let mut request = Request::builder()
            .uri("/api/search")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(AuthenticatedUser::new("42").with_role("member"));

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.events_for("user_42", "search").len(), 1);

        // anonymous callers on the same path count against api_strict by address
        let anonymous = Request::builder()
            .uri("/api/search")
            .header("x-real-ip", "10.0.0.9")
            .body(Body::empty())
            .unwrap();
        app.oneshot(anonymous).await.unwrap();
        assert_eq!(store.events_for("ip_10.0.0.9", "api_strict").len(), 1);
    }
}
