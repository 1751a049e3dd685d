//! Task placement: requirement profiles, eligibility filtering, weighted
//! ranking and dispatch with a single failover.

pub mod dispatcher;
pub mod matcher;
pub mod profile;
pub mod ranker;
pub mod task;

pub use dispatcher::{RouteOutcome, RoutedTask, CLOUD_FALLBACK};
pub use profile::{ProfileTable, RequirementProfile};
pub use ranker::RankedCandidate;
pub use task::{CompletionStatus, DispatchRequest, Priority, TaskCompletion, TaskRequest};
