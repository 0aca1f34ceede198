pub mod args;
pub mod commands;
pub mod config;
pub mod prompt;
