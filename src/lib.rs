pub mod bus;
pub mod config;
pub mod drive;
pub mod messages;
pub mod motion;
pub mod protocol;
pub mod runtime;
