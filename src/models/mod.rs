pub mod api;
pub mod compliance;
pub mod format;
pub mod issue;
pub mod job;
pub mod report;
pub mod status;
