/*
 * Biomapper Engine - Identifier Mapping Execution Engine
 *
 * Runs mapping strategies (ordered steps of pluggable actions) as
 * resumable, observable jobs.
 *
 * Architecture:
 * - Job State Machine (persisted through the JobStore port)
 * - Checkpoint/Resume System (checksummed context snapshots)
 * - Action Registry (built-in + runtime-registered handlers)
 * - Matching primitives (hash / merge / partitioned joins, composite ids,
 *   bidirectional validation)
 * - Bounded sub-batch concurrency for external resolvers
 * - Progress fan-out (callbacks and channels)
 */

// Public modules
pub mod action;
pub mod actions;
pub mod aggregator;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod matching;
pub mod orchestrator;
pub mod progress;
pub mod resolver;
pub mod strategy;
pub mod supervisor;
pub mod telemetry;

// Re-exports
pub use action::{ActionEnv, ActionHandler, ActionOutput, ActionRegistry, StepParams};
pub use aggregator::{AggregatedResult, ResultAggregator, ResultEntry, ResultStatus};
pub use batch::{BatchReport, BatchRunner, FailedBatch};
pub use checkpoint::CheckpointStore;
pub use config::{ConfigError, EngineConfig, ExecutionOptions};
pub use context::{Dataset, ExecutionContext, ProvenanceRecord, Record};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use job::JobStateMachine;
pub use matching::{
    BidirectionalValidator, CompositeKeyResolver, IdMatch, IdNormalizer, MatchRecord, MatchType,
    ValidationStatus,
};
pub use orchestrator::{ExecutionEngine, PauseSignal, RunControl, RunOutcome, RunReport};
pub use progress::{ProgressEvent, ProgressEventType, ProgressSnapshot, ProgressTracker};
pub use resolver::{IdentifierResolver, MappingTableResolver, ResolverRegistry};
pub use strategy::{ActionSpec, ResultSpec, Strategy, StrategyStep};
pub use supervisor::JobSupervisor;
pub use telemetry::init_tracing;
