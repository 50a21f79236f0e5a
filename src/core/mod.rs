pub mod conflict;
pub mod engine;
pub mod executor;
pub mod file_state;
pub mod fingerprint;
pub mod history;
pub mod monitor;
pub mod planner;
pub mod report;
pub mod scanner;

pub use conflict::{ConflictPolicy, ConflictRecord, ConflictResolution, ConflictType};
pub use engine::{EngineOptions, SyncEngine};
pub use executor::{ExecutorOptions, SyncExecutor};
pub use file_state::{MetadataStore, ObjectRecord, RecordChange, SyncState};
pub use fingerprint::{fingerprint, fingerprint_file, fingerprint_reader, Fingerprinter};
pub use history::RunHistory;
pub use monitor::{MonitorError, MonitorState, PollingMonitor};
pub use planner::{Action, ActionKind, ActionReason, DiffPlanner, PlanOptions, SyncPlan};
pub use report::{ActionCounts, Failure, RunReport, RunStatus};
pub use scanner::{FileScanner, ScanConfig};
