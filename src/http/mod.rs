//! HTTP surface: admission middleware, routes, and the server runner.

mod middleware;
mod server;

pub use middleware::{enforce_rate_limit, AppState};
pub use server::{build_router, HttpServer};
