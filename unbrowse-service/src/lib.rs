//! # unbrowse-service
//!
//! Turns ad-hoc browser interactions with a website into reusable,
//! authenticated, callable API skills. A capture session observes real
//! network traffic, infers the hidden API surface, reconstructs auth state,
//! detects data-flow dependencies between requests, and produces a skill
//! that replays headlessly later. A local HTTP control service exposes
//! resolve/execute/feedback/recipe endpoints over the skill store and the
//! marketplace index.
//!
//! ## Example
//!
//! ```rust,no_run
//! use unbrowse_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = Config::load()?;
//!
//!     // Initialize tracing
//!     init_tracing(&config);
//!
//!     // Build application state (skill store, marketplace client, caches)
//!     let state = AppState::build(config)?;
//!     state.spawn_background();
//!
//!     // Serve the control API
//!     let app = handlers::router(state.clone());
//!     Server::new(state).serve(app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod analyze;
pub mod auth;
pub mod browser;
pub mod config;
pub mod correlate;
pub mod error;
pub mod exchange;
pub mod handlers;
pub mod jsonpath;
pub mod observability;
pub mod project;
pub mod replay;
pub mod resolve;
pub mod server;
pub mod session;
pub mod skill;
pub mod state;
pub mod telemetry;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::handlers;
    pub use crate::observability::{init_tracing, shutdown_tracing};
    pub use crate::server::Server;
    pub use crate::state::AppState;

    pub use crate::analyze::{AnalyzedExchangeSet, EndpointGroup, HeaderProfile};
    pub use crate::auth::{AuthState, RefreshConfig, RefreshScheduler};
    pub use crate::browser::{BrowserControl, HttpBrowserControl};
    pub use crate::correlate::{infer_correlation_graph, CorrelationGraphV1, CorrelationLinkV1};
    pub use crate::exchange::{CapturedExchange, CapturedRequest, CapturedResponse, HeaderMap, ParamMap};
    pub use crate::project::{apply_projection, ProjectionSpec};
    pub use crate::replay::{
        execute_capture_chain, prepare_request_for_step, PreparedRequest, StepResponseRuntime,
        Transport,
    };
    pub use crate::resolve::{ResolveContext, ResolveOptions, Resolver};
    pub use crate::session::{run_capture_session, SessionRegistry};
    pub use crate::skill::{generate_skill, SkillManifest, SkillStore};
    pub use crate::telemetry::{ExecutionTrace, OrchestrationTiming, ResolveSource};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Re-export error handling utilities
    pub use anyhow::{self, Context as AnyhowContext};

    // Re-export time utilities
    pub use chrono::{DateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;

    // Re-export async trait for seam implementations
    pub use async_trait::async_trait;
}
