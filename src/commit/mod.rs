pub mod apply;
pub mod batch;
pub mod command;
pub mod executor;
pub mod patch;
