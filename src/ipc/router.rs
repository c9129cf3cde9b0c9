use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use tracing::debug;

type FamilyHandler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: [FamilyHandler; 6] = [
    handlers::core::try_handle,
    handlers::students::try_handle,
    handlers::teachers::try_handle,
    handlers::records::try_handle,
    handlers::summary::try_handle,
    handlers::exchange::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for family in FAMILIES {
        if let Some(resp) = family(state, &req) {
            return resp;
        }
    }

    debug!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
