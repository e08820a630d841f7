//! SiYuan note backend access.

pub mod client;
pub mod multipart;

pub use client::{BackendError, SiyuanClient};
