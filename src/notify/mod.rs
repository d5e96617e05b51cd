//! Long-run progress notices: schedule tracking plus the delivery seam.

pub mod longrun;
pub mod sink;

pub use longrun::{spawn_longrun_driver, LongRunNotifier, NotificationSchedule};
pub use sink::{LongRunNotice, ProgressSink};
