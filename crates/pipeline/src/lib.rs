//! Streaming pipeline runtime.
//!
//! Executes ordered pipelines of stateful activities against an unbounded
//! stream of input events, with per-group state isolation, stage-level
//! suspension resumed by timers, and value mapping between stages and the
//! pipeline-level buckets.

pub mod activity;
pub mod config;
pub mod context;
pub mod data;
pub mod definition;
pub mod error;
pub mod instance;
pub mod manager;
pub mod mapper;
pub mod registry;
pub mod resolve;
pub mod scope;
pub mod stage;
pub mod state;
pub mod stream;
pub mod telemetry;
pub mod testing;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use activity::*;
pub use config::*;
pub use context::{ExecutionContext, ExecutionStatus, UPDATE_TICKER, UPDATE_TIMER};
pub use data::{coerce, Attribute, IOMetadata, Type, ValueMap};
pub use definition::Definition;
pub use error::{ActivityError, PipelineError, PipelineResult};
pub use instance::{Instance, RunOutcome};
pub use manager::Manager;
pub use mapper::{Mapper, MapperFactory};
pub use registry::ActivityRegistry;
pub use resolve::Resolver;
pub use scope::{MultiScope, Scope, SharedScope, StageInputScope, StageOutputScope};
pub use stage::Stage;
pub use state::{MultiStateManager, SingleStateManager, State, StateManager};
pub use stream::{Stream, StreamSettings};
pub use telemetry::TelemetryService;
