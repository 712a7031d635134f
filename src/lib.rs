//! mddb store - Local-first, file-backed JSONL table engine
//!
//! Each table is one append-friendly text file with a schema header and one
//! JSON row per line, plus an optional content-addressed blob directory.

pub mod engine;
