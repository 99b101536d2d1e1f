//! Test fixtures for eventually-consistent repository mirroring: create
//! repositories, push content, and wait for it to become readable.

pub mod config;
pub mod exec;
pub mod fixture;
pub mod git;
pub mod host;
pub mod poll;
pub mod types;
