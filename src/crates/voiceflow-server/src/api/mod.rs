//! HTTP and websocket surface

pub mod events;
pub mod handlers;
pub mod routes;
pub mod ws;
