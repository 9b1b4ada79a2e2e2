// Library exports for the drover process supervisor

pub mod cli;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logs;
pub mod process;
