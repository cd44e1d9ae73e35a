//! The flockwork automation engine: scan → plan → schedule → execute.
//!
//! The [`engine::AutomationEngine`] owns every component and exposes the
//! in-process control surface; everything underneath communicates through
//! explicit interfaces, with no process-wide globals.

pub mod engine;
pub mod executor;
pub mod planner;
pub mod scanner;
pub mod shutdown;
pub mod supervisor;

pub use engine::{AutomationEngine, EngineError};
pub use scanner::{ScanMetrics, ScanState, ScannedPost, Scanner};
pub use shutdown::RunSignal;
pub use supervisor::{EngineStatus, Phase, Supervisor};
