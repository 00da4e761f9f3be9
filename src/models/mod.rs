pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::Error;
pub use job::{truncate_error, Job, JobCreate, JobRow, JobStatus, MAX_ERROR_LEN};
pub use options::{QueueOptions, Settings, TriggerOptions};
pub use schedule::TriggerSchedule;
pub use state::AppState;

mod backoff;
mod clock;
mod error;
mod job;
mod options;
mod schedule;
mod state;
