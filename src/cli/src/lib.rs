//! kra CLI - push local container images to kraud.

pub mod commands;
pub mod output;
pub mod signal;
