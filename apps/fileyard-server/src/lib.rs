//! Fileyard Server Library
//!
//! Resumable, chunked file ingestion with content-addressed deduplication.
//! The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Chunk storage, merging, content-addressed finalize, temp sweeping
//! - `db`: File metadata repository (SQLite)
//! - `routes`: HTTP surface over the upload core

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;
