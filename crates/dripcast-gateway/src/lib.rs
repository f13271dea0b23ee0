//! # Dripcast Gateway
//! Admin HTTP API (bearer token) and the public payment webhook.

pub mod error;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use server::{AppState, build_router, serve};
