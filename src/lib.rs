//! # syncq
//!
//! A durable, SQL-backed task queue with a single-process sync loop.
//!
//! Producers put named, keyed tasks on the queue through [`manager::TaskManager`].
//! A [`engine::SyncManager`] claims them one at a time, routes each to the
//! [`action::TaskAction`] registered for its name, and records the outcome.
//! The same loop runs periodic [`action::ScheduledAction`]s on named streams,
//! which is how the change-data-capture controllers in [`cdc`] are driven.

pub mod action;
pub mod cdc;
pub mod config;
pub mod db;
pub mod driver;
pub mod engine;
pub mod error;
pub mod manager;
pub mod model;
pub mod telemetry;
