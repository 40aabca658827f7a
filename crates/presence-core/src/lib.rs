//! presence-core — identity matching and attendance resolution.
//!
//! Matches captured facial templates against the enrolled gallery by
//! Euclidean distance, then resolves a match into the day's clock-in or
//! clock-out transition with lateness against the expected start time.

pub mod matcher;
pub mod resolver;
pub mod types;

pub use matcher::{EuclideanMatcher, MatchOutcome, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use resolver::{
    AttendanceLedger, AttendanceResolver, DirectoryError, LedgerError, ResolveError,
    ResolveOutcome, ScheduleError, ScheduleLookup, TemplateDirectory,
};
pub use types::{
    AttendanceRecord, CaptureMethod, EnrolledTemplate, Template, TemplateError, TemplateSnapshot,
    TEMPLATE_DIM,
};
