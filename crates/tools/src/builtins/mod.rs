pub mod reminder;
pub mod time;

pub use reminder::{ReminderRequest, RemindMeTool};
pub use time::TimeTool;
