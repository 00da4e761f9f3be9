mod jobqueue;
mod jobrunner;
mod schedulerservice;

pub mod trigger;

pub use jobqueue::JobQueue;
pub use jobrunner::{BatchRunner, RunOutcome, RunReport};
pub use schedulerservice::TriggerService;
pub use trigger::{ChannelTrigger, Trigger};
