//! Authentication: extraction, CSRF provenance, token refresh, credentials

pub mod credentials;
pub mod csrf;
pub mod extract;
pub mod refresh;
pub mod scheduler;
pub mod vault;
pub mod wallet;

pub use credentials::{provider_for, CredentialProvider, CredentialSource, LoginCredential};
pub use csrf::{infer_csrf_provenance, CsrfProvenance, CsrfSource};
pub use extract::{build_auth_state, extract_auth_headers, AuthMethod, AuthState};
pub use refresh::{
    detect_refresh_endpoint, extract_refresh_config, needs_refresh, RefreshConfig,
    RefreshProvider, TokenInfo,
};
pub use scheduler::{RefreshScheduler, RefreshSink};
pub use vault::CredentialVault;
pub use wallet::Wallet;
