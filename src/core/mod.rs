/// Sniffing core, independent of how results are shown
///
/// This package contains:
/// - The correlator that pairs requests and responses
/// - Display-ready output records and filters
/// - The live capture pipeline and its message bus
/// - The link parameter scanner
/// - Per-line exclusive leases
pub mod bus;
pub mod capture;
pub mod correlator;
pub mod lease;
pub mod record;
pub mod scanner;
pub mod task_manager;

// Re-export commonly used types
pub use bus::{Bus, CaptureCommand, CaptureEvent};
pub use capture::{CaptureControl, CaptureOptions, LiveCapture};
pub use correlator::{CorrelationState, RecordEvent};
pub use lease::{LeaseError, LineLease};
pub use record::{OutputRecord, RecordFilter, RecordId, TimeDisplay};
pub use scanner::{scan, FrameStats, ScanControl, ScanError, ScanOptions, ScanOutcome};
