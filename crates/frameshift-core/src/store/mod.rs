//! Persistent job store (SQLite via sqlx).
//!
//! Holds the durable transcoding queue, key/value meta (including the schema
//! version), content-addressed configuration snapshots, and batch bookkeeping
//! for multi-file submissions. The atomic `claim_next` transition is the only
//! way a job moves from `pending` to `processing`.

pub mod blobs;
pub mod db;
pub mod jobs;
pub mod migrations;
pub mod types;

#[cfg(test)]
mod tests;

pub use db::Store;
pub use types::*;
