//! REST transport, push channel and the runtime loop that drives the
//! `backend-core` state machines.

pub mod api;
pub mod push;
mod runtime;
#[cfg(test)]
mod testing;

pub use api::{AttachmentBody, ChatApi, RestApi, parse_api_base};
pub use push::{
    PushChannel, PushConnector, PushTransport, WsPushConnector, parse_push_base, push_base_for_api,
};
pub use runtime::{ChatServices, DEFAULT_REFRESH_INTERVAL_MS, RuntimeHandle, spawn_runtime};
