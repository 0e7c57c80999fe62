//! Gator - A command-line RSS feed aggregator
//!
//! Users register and log in by name, add RSS feeds, and aggregate feed
//! content into a local SQLite database. Each process invocation runs a
//! single command looked up by name in the [`commands::Commands`] registry.

pub mod aggregator;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod handlers;
