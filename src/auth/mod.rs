//! Provider credential lifecycle and the Coze OAuth integration.

pub mod coze;
pub mod credentials;

pub use coze::{CozeApi, CozeOAuthClient, CozeService};
pub use credentials::{CredentialManager, CredentialState, RefreshOutcome, TokenGrant, TokenRefresher};
