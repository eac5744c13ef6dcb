pub mod config;
pub mod error;
pub mod schedule;
pub mod types;

pub use config::AppConfig;
pub use error::{AudienceError, AudienceResult};
pub use schedule::Schedule;
pub use types::{DateRange, RuleId, SegmentRow, SetOperation, TransactionRecord, TriggerKind};
