//! RATCHET - durable workflow orchestration engine.
//!
//! Workflows are ordered lists of steps; every step boundary is a durable
//! recovery point. Embed this crate, register workflows, and serve the
//! process API:
//!
//! ```no_run
//! use ratchet::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ratchet_core::Result<()> {
//!     let registry = WorkflowRegistry::new();
//!     registry.register(
//!         Workflow::new("modify_note", Target::Modify)
//!             .step(Step::new("update_note", Signal::Success)),
//!     );
//!
//!     let config = RatchetConfig::default_with_database_url("postgres://localhost/ratchet");
//!     let engine = Engine::init(config, registry).await?;
//!     engine.recover_running().await?;
//!
//!     let router = ratchet_runtime::router(engine.clone());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, router).await.map_err(ratchet_core::RatchetError::Io)?;
//!     Ok(())
//! }
//! ```

pub use ratchet_core;
pub use ratchet_runtime;

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;

    pub use ratchet_core::config::{ExecutorKind, RatchetConfig};
    pub use ratchet_core::error::{RatchetError, Result};
    pub use ratchet_core::registry::WorkflowRegistry;
    pub use ratchet_core::settings::{EngineStatus, GlobalStatus};
    pub use ratchet_core::signal::{ProcessStatus, Signal, StepStatus};
    pub use ratchet_core::state::{merge_state, State};
    pub use ratchet_core::workflow::{
        accept_any_form, Assignee, ProcessStat, Step, Target, UserClaims, Workflow,
    };
    pub use ratchet_core::SYSTEM_USER;

    pub use ratchet_runtime::{Engine, QueueWorkerConfig};
}

pub use ratchet_runtime::{router, router_with_auth, Engine};

// Re-export the id/time crates the public API leans on.
pub use chrono;
pub use uuid;
