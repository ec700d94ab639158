use std::sync::Arc;

use relay_api::{CredentialValidator, RelayHub};

#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameLimits {
    pub(crate) max_message_bytes: usize,
    pub(crate) rate_limit_per_second: u32,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) hub: RelayHub,
    pub(crate) validator: Arc<dyn CredentialValidator>,
    pub(crate) limits: FrameLimits,
}
