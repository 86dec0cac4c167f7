//! Quotaguard - Sliding-Window Request Admission Control
//!
//! This crate decides whether a caller may perform an action, given a quota
//! of at most N requests per sliding time window. Decisions are shared across
//! processes through Redis when it is reachable and fall back to a
//! per-process store when it is not, so a decision is always produced.

pub mod config;
pub mod error;
pub mod ratelimit;
