//! Working-tree checkpoints kept in a shadow git repository per project.
//!
//! [`SnapshotEngine::track`] records the project's files as a git tree in a
//! repository stored outside the project; later calls diff, restore or
//! selectively revert against those trees. All engines of a process share one
//! [`RepoCoordinator`], which serializes work on each shadow repository and
//! throttles garbage collection.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod git;
pub mod project;
pub mod revert;
pub mod scheduler;

pub use config::{GcConfig, SnapshotConfig};
pub use coordinator::RepoCoordinator;
pub use engine::{CLEANUP_JOB_ID, FileDiff, Patch, SnapshotEngine, SnapshotHash};
pub use error::{SnapshotError, SnapshotResult};
pub use git::{Git, GitOutput};
pub use project::{GLOBAL_PROJECT, Project, Vcs};
pub use revert::{RevertConflict, RevertReport};
pub use scheduler::{IntervalScheduler, JobFn, ScheduledJob, Scheduler};
