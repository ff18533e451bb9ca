//! HTTP surface: access middleware, handlers and server

pub mod middleware;
mod router;
mod server;

pub use middleware::{RequestContext, access_middleware, bearer_token, client_ip};
pub use router::create_router;
pub use server::{AccessControl, Collaborators, Gateway};
