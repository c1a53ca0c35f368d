//! Kernel module - job execution infrastructure.

pub mod jobs;
