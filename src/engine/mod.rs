// mddb store - core module structure
pub mod config;
pub mod cli;
pub mod jsonl;

pub use config::StoreConfig;
pub use jsonl::{Record, Table, TableOptions};
