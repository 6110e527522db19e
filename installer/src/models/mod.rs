pub mod outcome;
pub mod progress;
pub mod request;
pub mod tier;
