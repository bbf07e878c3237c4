//! # pathsteer
//!
//! Path ranking, active latency probing and quality-driven failover for
//! path-aware networks.
//!
//! A connection to a peer has several simultaneously usable network paths.
//! pathsteer decides which one to send on: a pipeline of path processors ranks
//! the candidates, active probing measures their round trip times, and call
//! quality feedback from the peer penalizes the paths its inbound media
//! suffers on.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Call Session                           │
//! │        one connection per channel, shared prober/penalizers     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Path-Aware Connection                      │
//! │   effective path · path-down debouncing · receive extensions    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Root Path Processor                         │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │ Sorters  │─▶│ Latency  │─▶│ Channel  │─▶│ Overlap  │─▶ ...   │
//! │  │ Filters  │  │ Prober   │  │ Penalties│  │ Failover │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          Call Quality Monitors ◀──▶ Penalty Notifications       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Path Transport (external collaborator)          │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Numeric literals are clear
#![allow(clippy::cast_possible_truncation)]  // Intentional score calculations
#![allow(clippy::cast_sign_loss)]            // Scores are always positive
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::cast_possible_wrap)]        // Intentional for sequence arithmetic
#![allow(clippy::suboptimal_flops)]          // Clarity over micro-optimization
#![allow(clippy::similar_names)]             // state/stats are intentionally named
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::cognitive_complexity)]      // Complex state machines
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::struct_excessive_bools)]    // Boolean config fields are appropriate
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod path;
pub mod processor;
pub mod protocol;
pub mod quality;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest encoded penalty batch, one datagram without fragmentation.
pub const MAX_PENALTY_PAYLOAD: usize = 1200;

/// Default MTU of in-process transports
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Lowest weight rewards can push a path to
pub const MIN_PENALTY_WEIGHT: f64 = -0.2;

/// Highest weight penalties can push a path to
pub const MAX_PENALTY_WEIGHT: f64 = 10.0;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::connection::{ConnectionOptions, PathAwareConnection};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventSource, Listener};
    pub use crate::path::{Path, PathMetadata, PathSet};
    pub use crate::processor::{
        ActivePathProcessor, LatencyProbingPathProcessor, PathPenalizer, PathProcessor, Penalizer,
        PipelineBuilder, Stage,
    };
    pub use crate::quality::{CallQualityMonitor, PenaltyReceiver, StatisticsReport, StatsSource};
    pub use crate::session::CallPathSession;
    pub use crate::transport::{Message, PathTransport};
    pub use crate::types::*;
}
