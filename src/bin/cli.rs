//! mddb-store CLI - Main entry point for CLI binary
//!
//! Operator tool for inspecting and maintaining JSONL table files.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mddb_store::engine::cli::formatter::{format_size, CliFormatter};
use mddb_store::engine::cli::{BlobAction, Cli, Commands, IdAction, OutputFormat};
use mddb_store::engine::config::StoreConfig;
use mddb_store::engine::jsonl::{
    BlobRef, BlobStore, Column, Id, IdGenerator, Record, SchemaChange, Table, TableOptions, Value,
};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let config = match cli.config() {
        Ok(config) => config,
        Err(e) => {
            CliFormatter::error(&format!("{:#}", e));
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_filter);

    if let Err(e) = run_cli(cli, &config) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_cli(cli: Cli, config: &StoreConfig) -> Result<()> {
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Info { table } => cmd_info(config, &table, json),
        Commands::Dump { table, offset, limit } => cmd_dump(config, &table, offset, limit, json),
        Commands::Check { table } => cmd_check(config, &table, json),
        Commands::Schema { table, columns } => cmd_schema(config, &table, columns, json),
        Commands::Insert { table, json: row } => cmd_insert(config, &table, &row, json),
        Commands::Blob { action } => cmd_blob(config, action, json),
        Commands::Id { action } => cmd_id(action, json),
    }
}

fn open_table(config: &StoreConfig, table: &str) -> Result<Table<Record>> {
    let path = config.table_path(table);
    Table::open_with(&path, TableOptions::from(config))
        .with_context(|| format!("failed to open table {}", path.display()))
}

fn cmd_info(config: &StoreConfig, name: &str, json: bool) -> Result<()> {
    let table = open_table(config, name)?;
    let size = fs::metadata(table.path()).map(|m| m.len()).unwrap_or(0);
    let schema = table.schema();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "path": table.path().display().to_string(),
                "initialized": schema.is_some(),
                "rows": table.len(),
                "size": size,
                "schema": schema,
                "blob_dir": table.blob_store().dir().display().to_string(),
            })
        );
        return Ok(());
    }

    CliFormatter::header(&format!("Table {}", name));
    CliFormatter::kv("Path", &table.path().display().to_string());
    CliFormatter::kv("Rows", &table.len().to_string());
    CliFormatter::kv("Size", &format_size(size));
    CliFormatter::kv("Blobs", &table.blob_store().dir().display().to_string());

    match schema {
        Some(schema) => {
            CliFormatter::kv("Format", &schema.version);
            CliFormatter::header("Columns");
            for col in &schema.columns {
                CliFormatter::item(&describe_column(col));
            }
        }
        None => CliFormatter::warning("Table has no schema header yet"),
    }
    Ok(())
}

fn describe_column(col: &Column) -> String {
    let mut text = format!("{} ({}", col.name, col.column_type);
    if col.required {
        text.push_str(", required");
    }
    text.push(')');
    if let Some(desc) = &col.description {
        text.push_str(" - ");
        text.push_str(desc);
    }
    text
}

fn cmd_dump(config: &StoreConfig, name: &str, offset: usize, limit: usize, json: bool) -> Result<()> {
    let table = open_table(config, name)?;
    let rows = table.read_page(offset, limit);

    if json {
        println!("{}", serde_json::to_string(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        CliFormatter::info(&format!("No rows at offset {} ({} total)", offset, table.len()));
        return Ok(());
    }

    let columns: Vec<String> = match table.schema() {
        Some(schema) => schema.columns.into_iter().map(|c| c.name).collect(),
        None => Vec::new(),
    };
    let mut header = vec!["id"];
    header.extend(columns.iter().map(String::as_str));
    CliFormatter::table_header(&header);

    for row in &rows {
        let mut cells = vec![row.id.to_string()];
        cells.extend(columns.iter().map(|c| display_value(row.get(c))));
        CliFormatter::table_row(&cells);
    }
    CliFormatter::info(&format!(
        "Rows {}..{} of {}",
        offset,
        offset + rows.len(),
        table.len()
    ));
    Ok(())
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::Text(s)) => s.clone(),
        Some(other) => other.to_json_string(),
    }
}

fn cmd_check(config: &StoreConfig, name: &str, json: bool) -> Result<()> {
    let path = config.table_path(name);
    match Table::<Record>::open_with(&path, TableOptions::from(config)) {
        Ok(table) => {
            if json {
                println!("{}", serde_json::json!({ "ok": true, "rows": table.len() }));
            } else {
                CliFormatter::success(&format!("{}: {} rows OK", path.display(), table.len()));
            }
            Ok(())
        }
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "kind": format!("{:?}", e.kind()),
                        "error": e.to_string(),
                    })
                );
                std::process::exit(1);
            }
            Err(anyhow!(e).context(format!("{} failed to load", path.display())))
        }
    }
}

fn cmd_schema(config: &StoreConfig, name: &str, columns: Vec<Column>, json: bool) -> Result<()> {
    let table = open_table(config, name)?;
    let change = table.update_schema(columns)?;

    if json {
        let value = match &change {
            SchemaChange::Identical => serde_json::json!({ "change": "identical" }),
            SchemaChange::Additive { added } => serde_json::json!({ "change": "additive", "added": added }),
            SchemaChange::Breaking { removed, retyped } => serde_json::json!({
                "change": "breaking",
                "removed": removed,
                "retyped": retyped,
            }),
        };
        println!("{}", value);
        return Ok(());
    }

    match change {
        SchemaChange::Identical => CliFormatter::info("Schema unchanged"),
        SchemaChange::Additive { added } => {
            CliFormatter::success(&format!("Schema updated, added: {}", added.join(", ")))
        }
        SchemaChange::Breaking { removed, retyped } => {
            CliFormatter::success("Schema updated");
            if !removed.is_empty() {
                CliFormatter::warning(&format!("Removed columns: {}", removed.join(", ")));
            }
            if !retyped.is_empty() {
                CliFormatter::warning(&format!("Retyped columns: {}", retyped.join(", ")));
            }
            CliFormatter::warning("Existing rows were not migrated");
        }
    }
    Ok(())
}

fn cmd_insert(config: &StoreConfig, name: &str, row: &str, json: bool) -> Result<()> {
    let table = open_table(config, name)?;

    let mut fields = match serde_json::from_str::<serde_json::Value>(row).context("row is not valid JSON")? {
        serde_json::Value::Object(map) => map,
        other => return Err(anyhow!("row must be a JSON object, got {}", other)),
    };

    let id = match fields.remove("id") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Id::decode(&s)?,
        Some(serde_json::Value::Null) | Some(serde_json::Value::String(_)) | None => IdGenerator::new().next(),
        Some(other) => return Err(anyhow!("id must be a string, got {}", other)),
    };

    let record = Record {
        id,
        fields: fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
    };
    let stored = table.insert(record)?;

    if json {
        println!("{}", serde_json::to_string(&stored)?);
    } else {
        CliFormatter::success(&format!("Inserted row {}", stored.id));
    }
    Ok(())
}

fn cmd_blob(config: &StoreConfig, action: BlobAction, json: bool) -> Result<()> {
    match action {
        BlobAction::Put { table, file } => {
            let store = BlobStore::for_table(&config.table_path(&table));
            let mut input = File::open(&file).with_context(|| format!("failed to open {}", file.display()))?;
            let mut writer = store.writer()?;
            io::copy(&mut input, &mut writer).with_context(|| format!("failed to read {}", file.display()))?;
            let blob = writer.finish()?;

            if json {
                println!("{}", serde_json::json!({ "blob": blob, "size": blob.size() }));
            } else {
                CliFormatter::success(&format!("Stored {} ({})", blob, format_size(blob.size())));
            }
        }
        BlobAction::Get { table, blob, output } => {
            let store = BlobStore::for_table(&config.table_path(&table));
            let blob = BlobRef::parse(&blob)?;
            let mut input = store.open(&blob)?;
            match output {
                Some(path) => {
                    write_to(&path, &mut input)?;
                    if !json {
                        CliFormatter::success(&format!("Wrote {} to {}", format_size(blob.size()), path.display()));
                    }
                }
                None => {
                    io::copy(&mut input, &mut io::stdout().lock())?;
                }
            }
        }
        BlobAction::Exists { table, blob } => {
            let store = BlobStore::for_table(&config.table_path(&table));
            let blob = BlobRef::parse(&blob)?;
            let exists = store.contains(&blob);
            if json {
                println!("{}", serde_json::json!({ "blob": blob, "exists": exists }));
            } else if exists {
                CliFormatter::success(&format!("{} is stored at {}", blob, store.path_for(&blob).display()));
            } else {
                CliFormatter::warning(&format!("{} is not stored", blob));
            }
        }
    }
    Ok(())
}

fn write_to(path: &Path, input: &mut File) -> Result<()> {
    let mut out = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    io::copy(input, &mut out).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn cmd_id(action: IdAction, json: bool) -> Result<()> {
    match action {
        IdAction::New { count } => {
            let gen = IdGenerator::new();
            let ids: Vec<Id> = (0..count).map(|_| gen.next()).collect();
            if json {
                println!("{}", serde_json::to_string(&ids)?);
            } else {
                for id in ids {
                    println!("{}", id);
                }
            }
        }
        IdAction::Decode { id } => {
            let id = Id::decode(&id)?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "id": id,
                        "raw": id.as_u64(),
                        "timestamp": id.timestamp().to_rfc3339(),
                        "version": id.version(),
                        "random": id.random_bits(),
                    })
                );
            } else {
                CliFormatter::header(&format!("ID {}", id));
                CliFormatter::kv("Raw", &id.as_u64().to_string());
                CliFormatter::kv("Created", &id.timestamp().to_rfc3339());
                CliFormatter::kv("Version", &id.version().to_string());
                CliFormatter::kv("Random", &format!("{:#06x}", id.random_bits()));
            }
        }
        IdAction::Encode { raw } => {
            let id = Id::from_raw(raw);
            if json {
                println!("{}", serde_json::json!({ "id": id.encode(), "raw": raw }));
            } else {
                println!("{}", id.encode());
            }
        }
    }
    Ok(())
}
