//! Canonical sports line store.
//!
//! Provider feeds are resolved onto canonical teams and events, odds quotes
//! are kept as a bucketed time series, and picks are settled against final
//! results with closing-line value.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod feeds;
pub mod identity;
pub mod jobs;
pub mod odds;
pub mod settlement;
