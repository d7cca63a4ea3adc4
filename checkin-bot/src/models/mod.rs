mod checkin_record;
mod outcome;
mod session;
mod target;

pub use checkin_record::{CheckInRecord, CheckinStatus, FailureKind};
pub use outcome::AttemptOutcome;
pub use session::{Session, SessionSource};
pub use target::{CheckinMode, Target};
