//! Screengraph explorer - drives an app through a fixed node graph, records
//! every step in an append-only event log, and projects what it saw into a
//! deduplicated screen graph.

pub mod actors;
pub mod config;
pub mod db;
pub mod engine;
pub mod graph_store;
pub mod nodes;
pub mod ports;
