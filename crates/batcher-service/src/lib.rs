//! A process-wide call scheduler and memoizing cache for expensive asynchronous operations.
//!
//! The [`Scheduler`](caching::Scheduler) bounds how many calls run at once, coalesces concurrent
//! calls for the same key into a single execution, memoizes results with a time-to-live, and
//! persists the serializable part of its cache and its usage counters on a best-effort basis.

#![warn(missing_debug_implementations, clippy::all)]

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
