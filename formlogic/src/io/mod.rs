//! I/O for formlogic commands: files, config and worker processes.

pub mod config;
pub mod form_store;
pub mod task_runner;
pub mod worker;
