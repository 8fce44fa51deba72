pub mod proactive;
pub mod reminder;
