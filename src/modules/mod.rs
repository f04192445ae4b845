//! Modules layer - Infrastructure components
//!
//! Contains adapters for infrastructure concerns like disk storage.

pub mod storage;
