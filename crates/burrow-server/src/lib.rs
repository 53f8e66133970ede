//! Public-facing half of the burrow relay.
//!
//! [`dispatch`] owns the single public listener: it sniffs the request head,
//! routes subdomain traffic onto client sessions and falls through to the
//! [`api`] router for everything else (landing redirect, tunnel creation and
//! the management endpoints).

pub mod api;
pub mod dispatch;

pub use api::{admin_router, is_valid_subdomain, ApiState};
pub use dispatch::{IngressError, IngressServer};
