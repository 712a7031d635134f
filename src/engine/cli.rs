//! mddb Store CLI Module
//! Command-line interface for inspecting and maintaining table files

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::config::StoreConfig;
use super::jsonl::{Column, ColumnType};

#[derive(Parser, Debug)]
#[command(name = "mddb-store")]
#[command(author = "mddb Team")]
#[command(version)]
#[command(about = "Local-first JSONL table store", long_about = None)]
pub struct Cli {
    /// Data directory (defaults to the configured or platform data dir)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Skip fsync on writes
    #[arg(long, global = true)]
    pub no_sync: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show a table's schema and row count
    Info {
        /// Table name or path
        table: String,
    },

    /// Print rows
    Dump {
        /// Table name or path
        table: String,

        /// Rows to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Maximum rows to print
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Load a table and report the first problem found
    Check {
        /// Table name or path
        table: String,
    },

    /// Set a table's columns
    Schema {
        /// Table name or path
        table: String,

        /// Column as name:type[:required]
        #[arg(short, long = "column", value_parser = parse_column)]
        columns: Vec<Column>,
    },

    /// Insert a JSON object as a new row
    Insert {
        /// Table name or path
        table: String,

        /// Row fields as a JSON object
        json: String,
    },

    /// Blob store commands
    Blob {
        #[command(subcommand)]
        action: BlobAction,
    },

    /// Row identifier utilities
    Id {
        #[command(subcommand)]
        action: IdAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum BlobAction {
    /// Store a file and print its reference
    Put {
        /// Table the blob belongs to
        table: String,

        /// File to store
        file: PathBuf,
    },

    /// Write a blob's content to a file or stdout
    Get {
        /// Table the blob belongs to
        table: String,

        /// Blob reference
        blob: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check whether a blob is present
    Exists {
        /// Table the blob belongs to
        table: String,

        /// Blob reference
        blob: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum IdAction {
    /// Generate new identifiers
    New {
        /// How many to generate
        #[arg(short, long, default_value = "1")]
        count: usize,
    },

    /// Show the parts of an encoded identifier
    Decode {
        id: String,
    },

    /// Encode a raw 64-bit value
    Encode {
        raw: u64,
    },
}

/// Parse `name:type[:required]`.
pub fn parse_column(s: &str) -> Result<Column, String> {
    let mut parts = s.split(':');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or("column name is empty")?;
    let column_type: ColumnType = parts
        .next()
        .ok_or_else(|| format!("missing type in '{}'", s))?
        .parse()
        .map_err(|e: super::jsonl::StoreError| e.to_string())?;

    let column = Column::new(name, column_type);
    match parts.next() {
        None => Ok(column),
        Some("required") if parts.next().is_none() => Ok(column.required()),
        Some(_) => Err(format!("expected name:type[:required], got '{}'", s)),
    }
}

impl Cli {
    pub fn config(&self) -> anyhow::Result<StoreConfig> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => super::config::default_data_dir(),
        };
        let mut config = StoreConfig::load_or_default(&dir)?;
        if self.no_sync {
            config.tables.sync_writes = false;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_column() {
        let col = parse_column("name:text:required").unwrap();
        assert_eq!(col.name, "name");
        assert_eq!(col.column_type, ColumnType::Text);
        assert!(col.required);

        let col = parse_column("done:checkbox").unwrap();
        assert_eq!(col.column_type, ColumnType::Bool);
        assert!(!col.required);

        assert!(parse_column("name").is_err());
        assert!(parse_column(":text").is_err());
        assert!(parse_column("a:varchar").is_err());
        assert!(parse_column("a:text:optional").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "mddb-store",
            "--format",
            "json",
            "schema",
            "users",
            "--column",
            "name:text:required",
            "-c",
            "age:number",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Schema { table, columns } => {
                assert_eq!(table, "users");
                assert_eq!(columns.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
