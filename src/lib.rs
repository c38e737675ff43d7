//! # mintbot
//!
//! A rule-driven reward engine: regular-expression rules extract reward
//! amounts from raw chat text, convert them with per-source multipliers and
//! credit user accounts, with every parsed reward kept as an audit record.
//!
//! ## Features
//!
//! - **Configurable Parsing Rules**: Per-source regex patterns with decimal
//!   conversion multipliers, hot-reloadable without restarts
//! - **Atomic Crediting**: Transaction record and balance credit commit
//!   together or not at all
//! - **Configuration Management**: Validated all-or-nothing reloads, export
//!   and import, compressed backups with restore
//! - **Background Maintenance**: Periodic grant expiry, retention pruning
//!   and health monitoring with prompt shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mintbot::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(RewardStore::connect("mintbot.db").await?);
//!     store.migrate().await?;
//!
//!     let config = Arc::new(ConfigurationManager::new(Arc::clone(&store), "config"));
//!     config.initialize().await?;
//!
//!     let engine = RewardEngine::new(Arc::clone(&store), Arc::clone(&config));
//!     let event = RewardEvent::new("Fisher caught a fish! Coins: +20")
//!         .with_source_hint("Fisher");
//!     match engine.parse(&event).await? {
//!         ParseOutcome::Match(tx) => println!("credited {} {}", tx.converted_amount, tx.currency_type),
//!         ParseOutcome::NoMatch => println!("not a reward message"),
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod scheduler;
pub mod storage;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::config::{
        ConfigChangeEvent, ConfigExport, ConfigStats, ConfigurationManager,
        ConfigurationSnapshot, SnapshotSettings,
    };
    pub use crate::engine::{DefaultSourceMatcher, RewardEngine, SourceMatcher};
    pub use crate::scheduler::{GrantSweeper, MaintenanceScheduler, StoreGrantSweeper};
    pub use crate::storage::RewardStore;
    pub use crate::types::{
        Account, CleanupResult, EngineError, Grant, HealthStatus, ParseOutcome,
        ParsedTransaction, ParsingRule, RewardEvent, RuleChanges, SchedulerStatus, StorageError,
    };
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
