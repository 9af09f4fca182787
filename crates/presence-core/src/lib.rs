//! presence-core: face-based attendance engine.
//!
//! Head pose from six facial landmarks, identity matching over enrolled
//! embeddings, and a per-day check-in/check-out ledger. Face detection and
//! embedding extraction are supplied by the caller.

pub mod ledger;
pub mod liveness;
pub mod matcher;
pub mod memory;
pub mod pnp;
pub mod pose;
pub mod service;
pub mod storage;
pub mod types;

pub use ledger::{AttendanceLedger, AttendanceSession, EventKind, LedgerConfig, SessionEvent};
pub use matcher::{CosineDistanceMatcher, MatchOutcome, Matcher, MatcherConfig};
pub use pose::{FaceLandmarks, HeadDirection, LumaFrame, PoseEstimator, PoseResult};
pub use service::{AttendanceService, CheckinOutcome, ServiceConfig, ServiceError};
pub use storage::{AttendanceStore, EmbeddingRepository, StoreError};
pub use types::{Embedding, EnrolledIdentity};
