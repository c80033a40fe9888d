pub mod record;
pub mod scheduler;
pub mod value;

pub use record::{ChangeRecord, ProjectedRow};
pub use scheduler::{FailureSlot, RefreshScheduler};
pub use value::{JoinKey, ScalarValue};
