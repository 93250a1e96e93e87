use crate::error::{BookingError, Result};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, Row};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;
use std::path::PathBuf;

/// Column every booking table must carry; all lookups go through it.
pub const ID_FIELD: &str = "id";

/// Table used when no other name is configured.
pub const DEFAULT_TABLE: &str = "booking";

/// Core value types for SQLite operations
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl Value {
    /// Convert a JSON scalar into a store value.
    ///
    /// `field` only names the offending key in the error; arrays and objects
    /// have no column representation and are rejected. Integers outside the
    /// `i64` range are rejected rather than rounded to a float. Booleans are
    /// stored as 0/1 and only read back as booleans from columns whose
    /// declared type contains `BOOL`.
    pub fn from_json(field: &str, json: &serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Boolean(*b)),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Integer(i)),
                None if n.is_f64() => n.as_f64().map(Value::Real).ok_or_else(|| {
                    BookingError::malformed(format!("field `{field}` holds an unsupported number"))
                }),
                None => Err(BookingError::malformed(format!(
                    "field `{field}` does not fit in a 64-bit integer"
                ))),
            },
            Json::String(s) => Ok(Value::Text(s.clone())),
            Json::Array(_) | Json::Object(_) => Err(BookingError::malformed(format!(
                "field `{field}` must be a scalar value"
            ))),
        }
    }

    /// Decode a raw SQLite cell. Integers in boolean columns come back as
    /// booleans.
    fn from_sql_ref(value: ValueRef<'_>, boolean: bool) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) if boolean => Value::Boolean(i != 0),
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(r) => ToSqlOutput::from(*r),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
            Value::Boolean(b) => ToSqlOutput::from(*b),
        })
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(r) => serializer.serialize_f64(*r),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for byte in bytes {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            Value::Boolean(b) => serializer.serialize_bool(*b),
        }
    }
}

/// Equality conditions joined with `AND`. An empty query matches every row.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Query {
    pub conditions: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<Value>) -> Self {
        Self::new().with_condition(ID_FIELD, id)
    }

    pub fn with_condition(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((field.to_string(), value.into()));
        self
    }

    /// Human-readable form used in error messages, e.g. `id = 1`.
    pub fn describe(&self) -> String {
        if self.conditions.is_empty() {
            return "all records".to_string();
        }
        self.conditions
            .iter()
            .map(|(field, value)| format!("{field} = {value}"))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn fields(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|(field, _)| field.as_str())
    }

    fn values(&self) -> impl Iterator<Item = &Value> {
        self.conditions.iter().map(|(_, value)| value)
    }

    /// `WHERE` clause with placeholders numbered after `offset` bound
    /// parameters.
    fn where_clause(&self, offset: usize) -> String {
        if self.conditions.is_empty() {
            return String::new();
        }
        let terms = self
            .conditions
            .iter()
            .enumerate()
            .map(|(i, (field, _))| format!("{} = ?{}", quote_ident(field), offset + i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(" WHERE {terms}")
    }
}

/// One row of the booking table, fields in table column order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (field, value) in &self.fields {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

/// CRUD operation types
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOperation {
    /// Must match nothing, otherwise the insert is a conflict.
    pub key: Query,
    pub data: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOperation {
    pub query: Query,
    pub order_by: Option<Vec<(String, bool)>>, // (field, is_ascending)
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    /// Must match exactly one row.
    pub query: Query,
    pub updates: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOperation {
    /// Must match exactly one row.
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrudOperation {
    Create(CreateOperation),
    Read(ReadOperation),
    Update(UpdateOperation),
    Delete(DeleteOperation),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrudOutcome {
    Rows(Vec<Record>),
    Affected(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    /// Declared type as written in the schema, possibly empty.
    pub declared_type: String,
}

impl ColumnDefinition {
    fn is_boolean(&self) -> bool {
        self.declared_type.to_ascii_uppercase().contains("BOOL")
    }
}

/// Reflected shape of the booking table. Its columns are the only fields a
/// request may read or write.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    fn reflect(conn: &Connection, name: &str) -> rusqlite::Result<Vec<ColumnDefinition>> {
        let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map([name], |row| {
                Ok(ColumnDefinition {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    pub fn has_column(&self, field: &str) -> bool {
        self.columns.iter().any(|column| column.name == field)
    }

    fn check_fields<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for field in fields {
            if !self.has_column(field) {
                return Err(BookingError::UnknownField {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    fn quoted_name(&self) -> String {
        quote_ident(&self.name)
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn decode_row(&self, row: &Row<'_>) -> rusqlite::Result<Record> {
        let mut fields = Vec::with_capacity(self.columns.len());
        for (index, column) in self.columns.iter().enumerate() {
            let value = Value::from_sql_ref(row.get_ref(index)?, column.is_boolean());
            fields.push((column.name.clone(), value));
        }
        Ok(Record { fields })
    }
}

/// Where the record store lives, as decoded from a connection URL.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreLocation {
    Memory,
    Path(PathBuf),
    /// SQLite `file:` URI, passed through untouched.
    Uri(String),
}

/// Decode a `DATABASE_URL` value.
///
/// Accepts `sqlite://path`, `sqlite:path`, `file:` URIs, plain paths and the
/// in-memory forms `:memory:` / `sqlite::memory:`.
pub fn parse_database_url(url: &str) -> Result<StoreLocation> {
    let url = url.trim();
    if url.is_empty() {
        return Err(BookingError::unavailable("database URL is empty or unset"));
    }
    if matches!(url, ":memory:" | "sqlite::memory:" | "sqlite://:memory:") {
        return Ok(StoreLocation::Memory);
    }
    if url.starts_with("file:") {
        return Ok(StoreLocation::Uri(url.to_string()));
    }
    let path = if let Some(rest) = url.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = url.strip_prefix("sqlite:") {
        rest
    } else if let Some((scheme, _)) = url.split_once("://") {
        return Err(BookingError::unavailable(format!(
            "unsupported database scheme `{scheme}`"
        )));
    } else {
        url
    };
    if path.is_empty() {
        return Err(BookingError::unavailable(format!(
            "database URL `{url}` names no file"
        )));
    }
    Ok(StoreLocation::Path(PathBuf::from(path)))
}

/// Record store configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub database_url: String,
    pub table: String,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            table: table.into(),
        }
    }
}

/// Single-table record store over one SQLite connection.
///
/// The connection is closed when the store is dropped.
pub struct SqliteStore {
    conn: Connection,
    table: TableDefinition,
}

impl SqliteStore {
    /// Open the configured database and reflect its booking table.
    ///
    /// The database must already exist; a missing file is reported as
    /// [`BookingError::StoreUnavailable`] rather than created.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let location = parse_database_url(&config.database_url)?;
        let opened = match &location {
            StoreLocation::Memory => Connection::open_in_memory(),
            StoreLocation::Path(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            StoreLocation::Uri(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        };
        let conn = opened.map_err(|e| {
            BookingError::unavailable(format!("cannot open `{}`: {e}", config.database_url))
        })?;
        tracing::debug!(location = ?location, table = %config.table, "opened record store");
        Self::from_connection(conn, &config.table)
    }

    /// Wrap an already open connection.
    pub fn from_connection(conn: Connection, table: &str) -> Result<Self> {
        let columns = TableDefinition::reflect(&conn, table).map_err(|e| {
            BookingError::unavailable(format!("cannot inspect table `{table}`: {e}"))
        })?;
        if columns.is_empty() {
            return Err(BookingError::unavailable(format!(
                "table `{table}` does not exist"
            )));
        }
        let table = TableDefinition {
            name: table.to_string(),
            columns,
        };
        if !table.has_column(ID_FIELD) {
            return Err(BookingError::unavailable(format!(
                "table `{}` has no `{ID_FIELD}` column",
                table.name
            )));
        }
        Ok(Self { conn, table })
    }

    pub fn table(&self) -> &TableDefinition {
        &self.table
    }

    /// Perform a CRUD operation (type-safe API)
    ///
    /// Writes run in their own transaction, so the match check and the
    /// mutation either both happen or neither does.
    pub fn execute_crud(&mut self, op: CrudOperation) -> Result<CrudOutcome> {
        match op {
            CrudOperation::Read(read) => self.read(&read).map(CrudOutcome::Rows),
            CrudOperation::Create(create) => self.create(&create).map(CrudOutcome::Affected),
            CrudOperation::Update(update) => self.update(&update).map(CrudOutcome::Affected),
            CrudOperation::Delete(delete) => self.delete(&delete).map(CrudOutcome::Affected),
        }
    }

    fn read(&self, op: &ReadOperation) -> Result<Vec<Record>> {
        let table = &self.table;
        table.check_fields(op.query.fields())?;
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            table.column_list(),
            table.quoted_name(),
            op.query.where_clause(0)
        );
        if let Some(order_by) = op.order_by.as_ref().filter(|order| !order.is_empty()) {
            table.check_fields(order_by.iter().map(|(field, _)| field.as_str()))?;
            let terms = order_by
                .iter()
                .map(|(field, ascending)| {
                    format!("{} {}", quote_ident(field), if *ascending { "ASC" } else { "DESC" })
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms);
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(op.query.values()), |row| table.decode_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn create(&mut self, op: &CreateOperation) -> Result<usize> {
        let table = &self.table;
        table.check_fields(op.key.fields())?;
        table.check_fields(op.data.iter().map(|(field, _)| field.as_str()))?;
        if op.data.is_empty() {
            return Err(BookingError::malformed("nothing to insert"));
        }

        let tx = self.conn.transaction()?;
        if count_matches(&tx, table, &op.key)? > 0 {
            return Err(BookingError::Conflict {
                key: op.key.describe(),
            });
        }
        let columns = op
            .data
            .iter()
            .map(|(field, _)| quote_ident(field))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=op.data.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            table.quoted_name()
        );
        let inserted = tx.execute(&sql, params_from_iter(op.data.iter().map(|(_, v)| v)))?;
        tx.commit()?;
        tracing::info!(key = %op.key.describe(), "booking created");
        Ok(inserted)
    }

    fn update(&mut self, op: &UpdateOperation) -> Result<usize> {
        let table = &self.table;
        table.check_fields(op.query.fields())?;
        table.check_fields(op.updates.iter().map(|(field, _)| field.as_str()))?;

        let tx = self.conn.transaction()?;
        expect_single(count_matches(&tx, table, &op.query)?, &op.query)?;
        if op.updates.is_empty() {
            tx.commit()?;
            return Ok(0);
        }
        let assignments = op
            .updates
            .iter()
            .enumerate()
            .map(|(i, (field, _))| format!("{} = ?{}", quote_ident(field), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments}{}",
            table.quoted_name(),
            op.query.where_clause(op.updates.len())
        );
        let params = op
            .updates
            .iter()
            .map(|(_, value)| value)
            .chain(op.query.values());
        let updated = tx.execute(&sql, params_from_iter(params))?;
        tx.commit()?;
        tracing::info!(key = %op.query.describe(), fields = op.updates.len(), "booking updated");
        Ok(updated)
    }

    fn delete(&mut self, op: &DeleteOperation) -> Result<usize> {
        let table = &self.table;
        table.check_fields(op.query.fields())?;

        let tx = self.conn.transaction()?;
        expect_single(count_matches(&tx, table, &op.query)?, &op.query)?;
        let sql = format!(
            "DELETE FROM {}{}",
            table.quoted_name(),
            op.query.where_clause(0)
        );
        let deleted = tx.execute(&sql, params_from_iter(op.query.values()))?;
        tx.commit()?;
        tracing::info!(key = %op.query.describe(), "booking deleted");
        Ok(deleted)
    }
}

fn count_matches(conn: &Connection, table: &TableDefinition, query: &Query) -> Result<usize> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}{}",
        table.quoted_name(),
        query.where_clause(0)
    );
    let count: i64 = conn.query_row(&sql, params_from_iter(query.values()), |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn expect_single(count: usize, query: &Query) -> Result<()> {
    match count {
        1 => Ok(()),
        0 => Err(BookingError::NotFound {
            key: query.describe(),
        }),
        count => Err(BookingError::Ambiguous {
            key: query.describe(),
            count,
        }),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
