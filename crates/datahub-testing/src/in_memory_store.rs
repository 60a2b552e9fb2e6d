//! A `Store` double that understands the handful of statement shapes
//! `DownloadJob`/`ExportJob` issue, plus arbitrary seeded tables for
//! export-query tests. Not a SQL engine — good enough to drive the job
//! bodies under test without a real database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use datahub_core::store::{Conn, ExecResult, PoolMetrics, QueryResult, Row, Store, Tx};
use datahub_core::Result;

#[derive(Default)]
struct Tables {
    items: Vec<Row>,
    download_cursors: HashMap<String, Value>,
    seeded: HashMap<String, Vec<Row>>,
}

fn run_query(tables: &Mutex<Tables>, sql: &str, args: &[Value]) -> QueryResult {
    let sql_upper = sql.to_uppercase();
    let tables = tables.lock().expect("table lock poisoned");

    if sql_upper.starts_with("SELECT CURSOR FROM DOWNLOAD_METADATA") {
        let job_id = args.first().and_then(|v| v.as_str()).unwrap_or_default();
        return match tables.download_cursors.get(job_id).cloned() {
            Some(c) => {
                let mut row = Row::new();
                row.insert("cursor".into(), c);
                QueryResult { rows: vec![row] }
            }
            None => QueryResult::default(),
        };
    }

    for (name, rows) in tables.seeded.iter() {
        if sql_upper.contains(&format!("FROM {}", name.to_uppercase())) {
            let limit = args.first().and_then(|v| v.as_u64()).unwrap_or(u64::MAX) as usize;
            let offset = args.get(1).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let page = rows.iter().skip(offset).take(limit).cloned().collect();
            return QueryResult { rows: page };
        }
    }

    QueryResult::default()
}

fn run_exec(tables: &Mutex<Tables>, sql: &str, args: &[Value]) -> ExecResult {
    let sql_upper = sql.to_uppercase();
    let mut tables = tables.lock().expect("table lock poisoned");

    if sql_upper.starts_with("INSERT INTO ITEMS") {
        let job_id = args.first().cloned().unwrap_or(Value::Null);
        let payload = args.get(1).cloned().unwrap_or(Value::Null);
        let mut row = Row::new();
        row.insert("job_id".into(), job_id);
        row.insert("payload".into(), payload);
        tables.items.push(row);
        return ExecResult {
            rows_affected: 1,
            last_insert_id: Some(tables.items.len() as i64),
        };
    }

    if sql_upper.starts_with("INSERT INTO DOWNLOAD_METADATA") {
        let job_id = args.first().and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let cursor = args.get(1).cloned().unwrap_or(Value::Null);
        tables.download_cursors.insert(job_id, cursor);
        return ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        };
    }

    ExecResult::default()
}

/// An in-memory `Store`. `seed_table` lets a test populate a named
/// table an `ExportJob`'s query selects from (e.g. `SELECT * FROM
/// widgets`); `items`/`download_metadata` are understood directly
/// since `DownloadJob` writes to them by name.
#[derive(Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    pub fn seed_table(&self, name: &str, rows: Vec<Row>) {
        self.tables
            .lock()
            .expect("table lock poisoned")
            .seeded
            .insert(name.to_string(), rows);
    }

    pub fn items(&self) -> Vec<Row> {
        self.tables.lock().expect("table lock poisoned").items.clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryConn(Arc<Mutex<Tables>>);
pub struct InMemoryTx(Arc<Mutex<Tables>>);

#[async_trait]
impl Conn for InMemoryConn {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        Ok(run_query(&self.0, sql, args))
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        Ok(run_exec(&self.0, sql, args))
    }
}

#[async_trait]
impl Tx for InMemoryTx {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        Ok(run_query(&self.0, sql, args))
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        Ok(run_exec(&self.0, sql, args))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // No snapshot/undo is kept; good enough for tests that only
        // exercise the commit path.
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn lease(&self) -> Result<Box<dyn Conn>> {
        Ok(Box::new(InMemoryConn(Arc::clone(&self.tables))))
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        Ok(run_query(&self.tables, sql, args))
    }

    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        Ok(run_exec(&self.tables, sql, args))
    }

    async fn begin(&self) -> Result<Box<dyn Tx>> {
        Ok(Box::new(InMemoryTx(Arc::clone(&self.tables))))
    }

    fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            capacity: 1,
            leased: 0,
            idle: 1,
            lifetime_lease_timeouts: 0,
            lifetime_slow_queries: 0,
        }
    }
}
