use mddb_store::engine::jsonl::{
    Column, ColumnType, IdGenerator, Record, StoreError, Table, TableOptions, UniqueIndex, Value,
};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::thread;

fn people_columns() -> Vec<Column> {
    vec![
        Column::new("name", ColumnType::Text).required(),
        Column::new("age", ColumnType::Number),
        Column::new("admin", ColumnType::Bool),
        Column::new("joined", ColumnType::Date),
    ]
}

#[test]
fn test_reload_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let path = root.path().join("people.jsonl");
    let gen = IdGenerator::new();

    // 1. Create the table and insert a few rows
    let table: Table<Record> = Table::open_or_init(&path, people_columns())?;
    let mut written = Vec::new();
    for (name, age) in [("ada", "36"), ("grace", "85"), ("linus", "")] {
        let record = Record::new(gen.next())
            .with("name", name)
            .with("age", age)
            .with("joined", "2024-03-01");
        written.push(table.insert(record)?);
    }
    drop(table);

    // 2. Reopen and compare
    let table: Table<Record> = Table::open(&path)?;
    assert_eq!(table.schema().map(|s| s.columns), Some(people_columns()));
    assert_eq!(table.all().into_iter().collect::<Vec<_>>(), written);
    assert_eq!(written[2].get("age"), Some(&Value::Null));
    assert_eq!(
        written[0].get("joined"),
        Some(&Value::Text("2024-03-01T00:00:00.000Z".to_string()))
    );

    // 3. The file is one header line plus one line per row
    let content = fs::read_to_string(&path)?;
    assert_eq!(content.lines().count(), 4);
    Ok(())
}

#[test]
fn test_coercion_on_insert() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let gen = IdGenerator::new();
    let table: Table<Record> = Table::open_or_init(
        root.path().join("items.jsonl"),
        vec![
            Column::new("qty", ColumnType::Number),
            Column::new("price", ColumnType::Number),
            Column::new("a", ColumnType::Bool),
            Column::new("b", ColumnType::Bool),
        ],
    )?;

    let stored = table.insert(
        Record::new(gen.next())
            .with("qty", "42")
            .with("price", 19.99)
            .with("a", true)
            .with("b", false),
    )?;
    assert_eq!(stored.get("qty"), Some(&Value::Integer(42)));
    assert_eq!(stored.get("price"), Some(&Value::Real(19.99)));
    assert_eq!(stored.get("a"), Some(&Value::Integer(1)));
    assert_eq!(stored.get("b"), Some(&Value::Integer(0)));

    let err = table
        .insert(Record::new(gen.next()).with("qty", "many"))
        .unwrap_err();
    assert!(matches!(err, StoreError::Coercion { .. }));
    assert!(err.to_string().contains("qty"));
    assert_eq!(table.len(), 1);
    Ok(())
}

#[test]
fn test_pagination_over_large_table() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let path = root.path().join("log.jsonl");
    let gen = IdGenerator::new();
    let options = TableOptions::default().with_sync_writes(false);

    // 1. Append 10,000 rows
    let table: Table<Record> = Table::open_with(&path, options)?;
    let mut ids = Vec::with_capacity(10_000);
    for i in 0..10_000i64 {
        let record = Record::new(gen.next()).with("seq", i);
        ids.push(record.id);
        table.append(record)?;
    }
    drop(table);

    // 2. Reload and read one page from the middle
    let table: Table<Record> = Table::open_with(&path, options)?;
    assert_eq!(table.len(), 10_000);

    let page = table.read_page(5_000, 50);
    assert_eq!(page.len(), 50);
    for (i, row) in page.iter().enumerate() {
        assert_eq!(row.id, ids[5_000 + i]);
        assert_eq!(row.get("seq"), Some(&Value::Integer(5_000 + i as i64)));
    }
    assert_eq!(table.read_page(9_990, 50).len(), 10);
    Ok(())
}

#[test]
fn test_concurrent_appends() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let path = root.path().join("events.jsonl");
    let gen = Arc::new(IdGenerator::new());
    let table: Arc<Table<Record>> = Arc::new(Table::open_with(
        &path,
        TableOptions::default().with_sync_writes(false),
    )?);

    // 1. 100 writers, one row each
    let handles: Vec<_> = (0..100i64)
        .map(|i| {
            let table = Arc::clone(&table);
            let gen = Arc::clone(&gen);
            thread::spawn(move || table.append(Record::new(gen.next()).with("writer", i)))
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }
    assert_eq!(table.len(), 100);

    // 2. Every row is on its own line and ids are distinct
    let content = fs::read_to_string(&path)?;
    assert_eq!(content.lines().count(), 101);

    let reloaded: Table<Record> = Table::open(&path)?;
    let ids: HashSet<_> = reloaded.all().iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 100);

    // 3. In-memory order matches file order
    let mirror: Vec<_> = table.all().iter().map(|r| r.id).collect();
    let on_disk: Vec<_> = reloaded.all().iter().map(|r| r.id).collect();
    assert_eq!(mirror, on_disk);
    Ok(())
}

#[test]
fn test_unique_index_over_records() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let gen = IdGenerator::new();
    let table: Arc<Table<Record>> = Arc::new(Table::open_or_init(
        root.path().join("users.jsonl"),
        vec![Column::new("email", ColumnType::Text).required()],
    )?);

    let by_email = UniqueIndex::new(&table, |r: &Record| {
        r.get("email").and_then(Value::as_str).unwrap_or_default().to_string()
    })?;

    let ada = table.insert(Record::new(gen.next()).with("email", "ada@example.com"))?;
    assert_eq!(by_email.get(&"ada@example.com".to_string()), Some(ada));

    let err = table
        .insert(Record::new(gen.next()).with("email", "ada@example.com"))
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey(_)));
    assert_eq!(table.len(), 1);
    Ok(())
}
