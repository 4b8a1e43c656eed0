//! A toy SQL engine and an in-memory page store.
//!
//! `MemEngine` understands just enough SQL for the server test suites: CREATE TABLE, INSERT
//! with literal or `?` values, and plain SELECT projections. Each committed insert emits a
//! WAL frame into the attached `MemVfs`, mirroring how the real engine routes committed
//! transactions through its replicated virtual file system.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::Result;
use bytes::Bytes;
use sqlraft::server::sql::EngineError;
use sqlraft::server::sql::ExecResult;
use sqlraft::server::sql::PageStore;
use sqlraft::server::sql::Rows;
use sqlraft::server::sql::SqlConnection;
use sqlraft::server::sql::SqlEngine;
use sqlraft::server::sql::SqlStatement;
use sqlraft::server::sql::SqlValue;
use sqlraft::server::sql::WalFrame;

/// Result code used for any statement the toy engine refuses.
const ERR_SQL: u64 = 1;

/// A table: ordered column names plus rows of values.
#[derive(Default, Clone)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

#[derive(Default)]
struct MemDbInner {
    tables: HashMap<String, Table>,
    next_page: u32,
}

/// One logical database, shared between connections opened with the same name.
pub struct MemDb {
    name: String,
    inner: Mutex<MemDbInner>,
}

/// The toy SQL engine.
pub struct MemEngine {
    vfs: Arc<MemVfs>,
    dbs: Mutex<HashMap<String, Arc<MemDb>>>,
}

impl MemEngine {
    pub fn new(vfs: Arc<MemVfs>) -> Self {
        Self {
            vfs,
            dbs: Mutex::new(HashMap::new()),
        }
    }

    /// The page store this engine writes WAL frames into.
    pub fn vfs(&self) -> Arc<MemVfs> {
        self.vfs.clone()
    }
}

impl SqlEngine for MemEngine {
    type Connection = MemConnection;

    fn open(&self, name: &str, _flags: u64, _vfs: &str) -> Result<MemConnection, EngineError> {
        let mut dbs = self.dbs.lock().expect("engine lock poisoned");
        let db = dbs
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemDb {
                    name: name.to_string(),
                    inner: Mutex::new(MemDbInner::default()),
                })
            })
            .clone();
        Ok(MemConnection {
            db,
            vfs: self.vfs.clone(),
        })
    }
}

/// An open connection to a toy database.
pub struct MemConnection {
    db: Arc<MemDb>,
    vfs: Arc<MemVfs>,
}

impl SqlConnection for MemConnection {
    type Statement = MemStatement;

    fn prepare(&mut self, sql: &str) -> Result<MemStatement, EngineError> {
        let parsed = parse(sql)?;
        Ok(MemStatement {
            db: self.db.clone(),
            vfs: self.vfs.clone(),
            parsed,
        })
    }
}

/// A prepared statement against a toy database.
pub struct MemStatement {
    db: Arc<MemDb>,
    vfs: Arc<MemVfs>,
    parsed: Parsed,
}

impl SqlStatement for MemStatement {
    fn exec(&mut self, params: &[SqlValue]) -> Result<ExecResult, EngineError> {
        let mut inner = self.db.inner.lock().expect("db lock poisoned");
        match &self.parsed {
            Parsed::CreateTable { table, columns } => {
                if inner.tables.contains_key(table) {
                    return Err(EngineError::new(ERR_SQL, ERR_SQL, format!("table {} already exists", table)));
                }
                inner.tables.insert(
                    table.clone(),
                    Table {
                        columns: columns.clone(),
                        rows: Vec::new(),
                    },
                );
                Ok(ExecResult::default())
            }
            Parsed::Insert { table, values } => {
                let row = bind(values, params)?;
                let existing = inner
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| EngineError::new(ERR_SQL, ERR_SQL, format!("no such table: {}", table)))?;
                if row.len() != existing.columns.len() {
                    return Err(EngineError::new(
                        ERR_SQL,
                        ERR_SQL,
                        format!("{} values for {} columns", row.len(), existing.columns.len()),
                    ));
                }
                existing.rows.push(row.clone());
                let rowid = existing.rows.len() as u64;

                // A committed write surfaces as a WAL frame in the page store.
                inner.next_page += 1;
                let frame = WalFrame {
                    page_number: inner.next_page,
                    data: Bytes::from(render_row(&row)),
                };
                if let Err(err) = self.vfs.apply_frames(&self.db.name, &[frame]) {
                    return Err(EngineError::new(ERR_SQL, ERR_SQL, format!("wal write failed: {}", err)));
                }

                Ok(ExecResult {
                    last_insert_id: rowid,
                    rows_affected: 1,
                })
            }
            Parsed::Select { .. } => Err(EngineError::new(ERR_SQL, ERR_SQL, "cannot exec a query statement")),
        }
    }

    fn query(&mut self, params: &[SqlValue]) -> Result<Rows, EngineError> {
        let inner = self.db.inner.lock().expect("db lock poisoned");
        match &self.parsed {
            Parsed::Select { table, columns } => {
                let _ = params;
                let existing = inner
                    .tables
                    .get(table)
                    .ok_or_else(|| EngineError::new(ERR_SQL, ERR_SQL, format!("no such table: {}", table)))?;

                let projected: Vec<usize> = if columns.len() == 1 && columns[0] == "*" {
                    (0..existing.columns.len()).collect()
                } else {
                    let mut idx = Vec::with_capacity(columns.len());
                    for column in columns {
                        let i = existing
                            .columns
                            .iter()
                            .position(|c| c == column)
                            .ok_or_else(|| EngineError::new(ERR_SQL, ERR_SQL, format!("no such column: {}", column)))?;
                        idx.push(i);
                    }
                    idx
                };

                Ok(Rows {
                    columns: projected.iter().map(|i| existing.columns[*i].clone()).collect(),
                    rows: existing
                        .rows
                        .iter()
                        .map(|row| projected.iter().map(|i| row[*i].clone()).collect())
                        .collect(),
                })
            }
            _ => Err(EngineError::new(ERR_SQL, ERR_SQL, "not a query statement")),
        }
    }
}

/// A value slot in an INSERT statement: a literal or a `?` placeholder.
#[derive(Clone, Debug)]
enum Slot {
    Literal(SqlValue),
    Param,
}

#[derive(Clone, Debug)]
enum Parsed {
    CreateTable { table: String, columns: Vec<String> },
    Insert { table: String, values: Vec<Slot> },
    Select { table: String, columns: Vec<String> },
}

fn bind(values: &[Slot], params: &[SqlValue]) -> Result<Vec<SqlValue>, EngineError> {
    let mut bound = Vec::with_capacity(values.len());
    let mut next = 0;
    for slot in values {
        match slot {
            Slot::Literal(value) => bound.push(value.clone()),
            Slot::Param => {
                let value = params
                    .get(next)
                    .ok_or_else(|| EngineError::new(ERR_SQL, ERR_SQL, "not enough bound parameters"))?;
                bound.push(value.clone());
                next += 1;
            }
        }
    }
    Ok(bound)
}

fn render_row(row: &[SqlValue]) -> Vec<u8> {
    let fields: Vec<String> = row
        .iter()
        .map(|value| match value {
            SqlValue::Integer(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Blob(v) => format!("{:02x?}", v),
            SqlValue::Null => "NULL".to_string(),
        })
        .collect();
    fields.join("|").into_bytes()
}

/// Parse one of the three statement shapes the toy engine understands.
fn parse(sql: &str) -> Result<Parsed, EngineError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();

    if upper.starts_with("CREATE TABLE") {
        let rest = trimmed["CREATE TABLE".len()..].trim();
        let open = rest.find('(').ok_or_else(|| syntax(sql))?;
        let close = rest.rfind(')').ok_or_else(|| syntax(sql))?;
        let table = rest[..open].trim().to_string();
        if table.is_empty() || close <= open {
            return Err(syntax(sql));
        }
        let columns: Vec<String> = rest[open + 1..close]
            .split(',')
            .map(|c| c.trim().split_whitespace().next().unwrap_or("").to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if columns.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Parsed::CreateTable { table, columns });
    }

    if upper.starts_with("INSERT INTO") {
        let rest = trimmed["INSERT INTO".len()..].trim();
        let values_at = rest.to_uppercase().find("VALUES").ok_or_else(|| syntax(sql))?;
        let table = rest[..values_at].trim().to_string();
        let tail = rest[values_at + "VALUES".len()..].trim();
        let open = tail.find('(').ok_or_else(|| syntax(sql))?;
        let close = tail.rfind(')').ok_or_else(|| syntax(sql))?;
        if close <= open || table.is_empty() {
            return Err(syntax(sql));
        }
        let mut values = Vec::new();
        for token in split_values(&tail[open + 1..close]) {
            values.push(parse_value(token.trim(), sql)?);
        }
        return Ok(Parsed::Insert { table, values });
    }

    if upper.starts_with("SELECT") {
        let rest = trimmed["SELECT".len()..].trim();
        let from_at = rest.to_uppercase().find(" FROM ").ok_or_else(|| syntax(sql))?;
        let columns: Vec<String> = rest[..from_at].split(',').map(|c| c.trim().to_string()).collect();
        let table = rest[from_at + " FROM ".len()..].trim().to_string();
        if table.is_empty() || columns.is_empty() {
            return Err(syntax(sql));
        }
        return Ok(Parsed::Select { table, columns });
    }

    Err(syntax(sql))
}

fn syntax(sql: &str) -> EngineError {
    EngineError::new(ERR_SQL, ERR_SQL, format!("near \"{}\": syntax error", sql.trim()))
}

/// Split a VALUES tuple on commas, respecting single-quoted strings.
fn split_values(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

fn parse_value(token: &str, sql: &str) -> Result<Slot, EngineError> {
    if token == "?" {
        return Ok(Slot::Param);
    }
    if token.eq_ignore_ascii_case("null") {
        return Ok(Slot::Literal(SqlValue::Null));
    }
    if token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2 {
        return Ok(Slot::Literal(SqlValue::Text(token[1..token.len() - 1].to_string())));
    }
    if token.contains('.') {
        if let Ok(v) = token.parse::<f64>() {
            return Ok(Slot::Literal(SqlValue::Float(v)));
        }
    }
    if let Ok(v) = token.parse::<i64>() {
        return Ok(Slot::Literal(SqlValue::Integer(v)));
    }
    Err(syntax(sql))
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory page store implementing the `PageStore` trait.
#[derive(Default)]
pub struct MemVfs {
    dbs: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
}

impl MemVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of pages stored for the given database.
    pub fn page_count(&self, db: &str) -> usize {
        let dbs = self.dbs.lock().expect("vfs lock poisoned");
        dbs.get(db).map(|pages| pages.len()).unwrap_or(0)
    }

    /// The content of one page, for assertions.
    pub fn page(&self, db: &str, page_number: u32) -> Option<Vec<u8>> {
        let dbs = self.dbs.lock().expect("vfs lock poisoned");
        dbs.get(db).and_then(|pages| pages.get(&page_number).cloned())
    }
}

impl PageStore for MemVfs {
    fn apply_frames(&self, db: &str, frames: &[WalFrame]) -> Result<()> {
        let mut dbs = self.dbs.lock().map_err(|_| anyhow!("vfs lock poisoned"))?;
        let pages = dbs.entry(db.to_string()).or_insert_with(BTreeMap::new);
        for frame in frames {
            pages.insert(frame.page_number, frame.data.to_vec());
        }
        Ok(())
    }

    fn snapshot(&self, db: &str) -> Result<Bytes> {
        let dbs = self.dbs.lock().map_err(|_| anyhow!("vfs lock poisoned"))?;
        let pages: Vec<(u32, Vec<u8>)> = dbs
            .get(db)
            .map(|pages| pages.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default();
        Ok(Bytes::from(serde_json::to_vec(&pages)?))
    }

    fn restore(&self, db: &str, data: Bytes) -> Result<()> {
        let pages: Vec<(u32, Vec<u8>)> = serde_json::from_slice(&data)?;
        let mut dbs = self.dbs.lock().map_err(|_| anyhow!("vfs lock poisoned"))?;
        dbs.insert(db.to_string(), pages.into_iter().collect());
        Ok(())
    }
}
