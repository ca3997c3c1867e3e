pub mod message;
pub mod monitoring;
