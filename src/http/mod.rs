//! HTTP surface: rate limit headers, the admission middleware, the check
//! service and the admin routes.

pub mod admin;
pub mod middleware;
pub mod response;
mod server;

pub use middleware::{enforce, Admission, RateLimit, RequestParts};
pub use response::{denied, format_wait, is_api_request, write_headers, RateLimitExceeded};
pub use server::{check_router, HealthResponse, HttpServer, X_ORIGINAL_METHOD, X_ORIGINAL_URI};
