//! Process-level services shared by the bridge binary.

pub mod logger;
