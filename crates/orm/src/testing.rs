//! In-memory database for unit tests
//!
//! `MemoryDatabase` implements `DatabasePool` over a tiny model of the
//! PostgreSQL catalog: schemas, tables, indexes and the rows of any table
//! written through the ledger statements. Statements inside `BEGIN` are
//! buffered per connection and replayed on `COMMIT`, so a rolled back or
//! discarded transaction leaves no trace and concurrent connections only
//! ever see committed state.

use crate::backends::{
    DatabaseConnection, DatabasePool, DatabasePoolConfig, DatabasePoolStats, DatabaseRow,
    DatabaseValue,
};
use crate::connection::ManagedPool;
use crate::error::{OrmError, OrmResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One row written through the ledger statements
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub area_type: String,
    pub area_name: String,
    pub migration_name: String,
    pub sha1: String,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct State {
    schemas: BTreeSet<String>,
    tables: BTreeMap<String, Vec<LedgerRecord>>,
    indexes: BTreeSet<String>,
    ticks: i64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            schemas: ["public", "pg_catalog"].iter().map(|s| s.to_string()).collect(),
            tables: BTreeMap::new(),
            indexes: BTreeSet::new(),
            ticks: 0,
        }
    }
}

#[derive(Default)]
struct Inner {
    state: State,
    statements: Vec<String>,
    fail_on: Vec<String>,
    insert_affected: Option<u64>,
    refuse: bool,
    refuse_close: bool,
    pool_closes: usize,
    discarded: usize,
    open: u32,
}

/// Shared in-memory database. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn managed_pool(&self) -> ManagedPool {
        ManagedPool::new(Arc::new(self.clone()), DatabasePoolConfig::default())
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut *inner)
    }

    /// Every later `acquire` fails
    pub fn refuse_connections(&self) {
        self.with(|inner| inner.refuse = true);
    }

    /// Closing the pool reports an error
    pub fn refuse_close(&self) {
        self.with(|inner| inner.refuse_close = true);
    }

    /// Fail any statement whose normalized text contains `fragment`
    pub fn fail_on(&self, fragment: &str) {
        self.with(|inner| inner.fail_on.push(normalize(fragment)));
    }

    /// Report `affected` for ledger inserts instead of the real count
    pub fn ledger_insert_affects(&self, affected: u64) {
        self.with(|inner| inner.insert_affected = Some(affected));
    }

    pub fn close_calls(&self) -> usize {
        self.with(|inner| inner.pool_closes)
    }

    /// Connections closed instead of being returned
    pub fn discarded_connections(&self) -> usize {
        self.with(|inner| inner.discarded)
    }

    pub fn open_connections(&self) -> u32 {
        self.with(|inner| inner.open)
    }

    pub fn statements(&self) -> Vec<String> {
        self.with(|inner| inner.statements.clone())
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.with(|inner| inner.state.schemas.contains(name))
    }

    /// `name` is `schema.table`
    pub fn has_table(&self, name: &str) -> bool {
        self.with(|inner| inner.state.tables.contains_key(name))
    }

    pub fn indexes(&self) -> Vec<String> {
        self.with(|inner| inner.state.indexes.iter().cloned().collect())
    }

    pub fn ledger_rows(&self, table: &str) -> Vec<LedgerRecord> {
        self.with(|inner| inner.state.tables.get(table).cloned().unwrap_or_default())
    }

    /// Insert a committed ledger row directly
    pub fn seed_ledger_row(&self, table: &str, area: (&str, &str), name: &str, sha1: &str) {
        self.with(|inner| {
            inner.state.ticks += 1;
            let run_at = clock(inner.state.ticks);
            inner
                .state
                .tables
                .entry(table.to_string())
                .or_default()
                .push(LedgerRecord {
                    area_type: area.0.to_string(),
                    area_name: area.1.to_string(),
                    migration_name: name.to_string(),
                    sha1: sha1.to_string(),
                    run_at,
                });
        });
    }
}

#[async_trait]
impl DatabasePool for MemoryDatabase {
    async fn acquire(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        let refused = self.with(|inner| {
            if !inner.refuse {
                inner.open += 1;
            }
            inner.refuse
        });
        if refused {
            return Err(OrmError::Connection("connection refused".to_string()));
        }

        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            pending: None,
            aborted: false,
        }))
    }

    async fn close(&self) -> OrmResult<()> {
        let refused = self.with(|inner| {
            inner.pool_closes += 1;
            inner.refuse_close
        });
        if refused {
            return Err(OrmError::Connection("server went away".to_string()));
        }
        Ok(())
    }

    fn stats(&self) -> DatabasePoolStats {
        let open = self.open_connections();
        DatabasePoolStats {
            total_connections: open,
            idle_connections: 0,
            active_connections: open,
        }
    }
}

type PendingStatement = (String, Vec<DatabaseValue>);

struct MemoryConnection {
    inner: Arc<Mutex<Inner>>,
    pending: Option<Vec<PendingStatement>>,
    aborted: bool,
}

enum Outcome {
    Affected(u64),
    Rows(Vec<MemoryRow>),
}

impl MemoryConnection {
    fn run(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Outcome> {
        let mut inner = self.inner.lock().unwrap();
        inner.statements.push(sql.to_string());
        let norm = normalize(sql);
        let injected = inner.fail_on.iter().any(|f| norm.contains(f.as_str()));

        match norm.as_str() {
            "begin" => {
                if injected {
                    return Err(OrmError::Query("injected failure on BEGIN".to_string()));
                }
                self.pending = Some(Vec::new());
                self.aborted = false;
                return Ok(Outcome::Affected(0));
            }
            "rollback" => {
                self.pending = None;
                self.aborted = false;
                if injected {
                    return Err(OrmError::Query("injected failure on ROLLBACK".to_string()));
                }
                return Ok(Outcome::Affected(0));
            }
            "commit" => {
                let pending = self.pending.take().unwrap_or_default();
                if injected {
                    return Err(OrmError::Query("injected failure on COMMIT".to_string()));
                }
                // COMMIT of an aborted transaction rolls back
                if std::mem::take(&mut self.aborted) {
                    return Ok(Outcome::Affected(0));
                }
                let insert_affected = inner.insert_affected;
                let mut next = inner.state.clone();
                for (statement, values) in &pending {
                    apply(&mut next, statement, values, insert_affected)?;
                }
                inner.state = next;
                return Ok(Outcome::Affected(0));
            }
            _ => {}
        }

        if self.aborted {
            return Err(OrmError::Query(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .to_string(),
            ));
        }

        let result = if injected {
            Err(OrmError::Query(format!("injected failure: {}", sql)))
        } else {
            let insert_affected = inner.insert_affected;
            match self.pending.as_mut() {
                None => apply(&mut inner.state, sql, params, insert_affected),
                Some(pending) => {
                    let mut view = inner.state.clone();
                    for (statement, values) in pending.iter() {
                        apply(&mut view, statement, values, insert_affected)?;
                    }
                    let outcome = apply(&mut view, sql, params, insert_affected);
                    if outcome.is_ok() {
                        pending.push((sql.to_string(), params.to_vec()));
                    }
                    outcome
                }
            }
        };

        if result.is_err() && self.pending.is_some() {
            self.aborted = true;
        }
        result
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        Ok(match self.run(sql, params)? {
            Outcome::Affected(n) => n,
            Outcome::Rows(rows) => rows.len() as u64,
        })
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        Ok(match self.run(sql, params)? {
            Outcome::Affected(_) => Vec::new(),
            Outcome::Rows(rows) => rows
                .into_iter()
                .map(|row| Box::new(row) as Box<dyn DatabaseRow>)
                .collect(),
        })
    }

    async fn close(self: Box<Self>) -> OrmResult<()> {
        self.inner.lock().unwrap().discarded += 1;
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.open = inner.open.saturating_sub(1);
        }
    }
}

fn clock(ticks: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 11, 21, 20, 21, 3).unwrap() + Duration::seconds(ticks)
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim()
        .to_lowercase()
}

fn strip_flag<'a>(rest: &'a str, flag: &str) -> (bool, &'a str) {
    match rest.strip_prefix(flag) {
        Some(rest) => (true, rest),
        None => (false, rest),
    }
}

fn ident(rest: &str) -> String {
    rest.split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .replace('"', "")
}

fn qualified(rest: &str) -> String {
    let name = ident(rest);
    if name.contains('.') {
        name
    } else {
        format!("public.{}", name)
    }
}

fn text(params: &[DatabaseValue], index: usize) -> OrmResult<String> {
    match params.get(index) {
        Some(DatabaseValue::String(s)) => Ok(s.clone()),
        other => Err(OrmError::Query(format!(
            "expected text parameter ${}, got {:?}",
            index + 1,
            other
        ))),
    }
}

fn error(message: String) -> OrmError {
    OrmError::Query(message)
}

fn one_row() -> MemoryRow {
    MemoryRow(vec![("?column?".to_string(), DatabaseValue::Int32(1))])
}

fn apply(
    state: &mut State,
    sql: &str,
    params: &[DatabaseValue],
    insert_affected: Option<u64>,
) -> OrmResult<Outcome> {
    let norm = normalize(sql);

    if norm.contains("pg_advisory_xact_lock") {
        return Ok(Outcome::Rows(vec![MemoryRow(vec![(
            "pg_advisory_xact_lock".to_string(),
            DatabaseValue::Null,
        )])]));
    }

    if norm.contains("pg_catalog.pg_namespace") {
        let found = state.schemas.contains(&text(params, 0)?);
        return Ok(Outcome::Rows(if found { vec![one_row()] } else { vec![] }));
    }

    if norm.contains("pg_catalog.pg_tables") {
        let key = format!("{}.{}", text(params, 0)?, text(params, 1)?);
        let found = state.tables.contains_key(&key);
        return Ok(Outcome::Rows(if found { vec![one_row()] } else { vec![] }));
    }

    if let Some(rest) = norm.strip_prefix("create schema ") {
        let (if_not_exists, rest) = strip_flag(rest, "if not exists ");
        let name = ident(rest);
        if !state.schemas.insert(name.clone()) && !if_not_exists {
            return Err(error(format!("schema \"{}\" already exists", name)));
        }
        return Ok(Outcome::Affected(0));
    }

    if let Some(rest) = norm.strip_prefix("create table ") {
        let (if_not_exists, rest) = strip_flag(rest, "if not exists ");
        let name = qualified(rest);
        let schema = name.split('.').next().unwrap_or_default();
        if !state.schemas.contains(schema) {
            return Err(error(format!("schema \"{}\" does not exist", schema)));
        }
        if state.tables.contains_key(&name) {
            if if_not_exists {
                return Ok(Outcome::Affected(0));
            }
            return Err(error(format!("relation \"{}\" already exists", name)));
        }
        state.tables.insert(name, Vec::new());
        return Ok(Outcome::Affected(0));
    }

    let index_rest = norm
        .strip_prefix("create index ")
        .or_else(|| norm.strip_prefix("create unique index "));
    if let Some(rest) = index_rest {
        let (if_not_exists, rest) = strip_flag(rest, "if not exists ");
        let name = ident(rest);
        let table = rest
            .split_once(" on ")
            .map(|(_, target)| qualified(target))
            .unwrap_or_default();
        if !state.tables.contains_key(&table) {
            return Err(error(format!("relation \"{}\" does not exist", table)));
        }
        if !state.indexes.insert(name.clone()) && !if_not_exists {
            return Err(error(format!("relation \"{}\" already exists", name)));
        }
        return Ok(Outcome::Affected(0));
    }

    if let Some(rest) = norm.strip_prefix("drop table ") {
        let (if_exists, rest) = strip_flag(rest, "if exists ");
        let name = qualified(rest);
        if state.tables.remove(&name).is_none() && !if_exists {
            return Err(error(format!("table \"{}\" does not exist", name)));
        }
        return Ok(Outcome::Affected(0));
    }

    if let Some(rest) = norm.strip_prefix("drop schema ") {
        let (if_exists, rest) = strip_flag(rest, "if exists ");
        let name = ident(rest);
        let prefix = format!("{}.", name);
        if state.tables.keys().any(|t| t.starts_with(&prefix)) {
            return Err(error(format!(
                "cannot drop schema {} because other objects depend on it",
                name
            )));
        }
        if !state.schemas.remove(&name) && !if_exists {
            return Err(error(format!("schema \"{}\" does not exist", name)));
        }
        return Ok(Outcome::Affected(0));
    }

    if let Some(rest) = norm.strip_prefix("insert into ") {
        let table = qualified(rest);
        let rows = state
            .tables
            .get_mut(&table)
            .ok_or_else(|| error(format!("relation \"{}\" does not exist", table)))?;
        if !norm.contains("sha1") {
            return Ok(Outcome::Affected(1));
        }

        let affected = insert_affected.unwrap_or(1);
        if affected > 0 {
            state.ticks += 1;
            rows.push(LedgerRecord {
                area_type: text(params, 0)?,
                area_name: text(params, 1)?,
                migration_name: text(params, 2)?,
                sha1: text(params, 3)?,
                run_at: clock(state.ticks),
            });
        }
        return Ok(Outcome::Affected(affected));
    }

    if let Some(rest) = norm.strip_prefix("delete from ") {
        let table = qualified(rest);
        let rows = state
            .tables
            .get_mut(&table)
            .ok_or_else(|| error(format!("relation \"{}\" does not exist", table)))?;
        if !norm.contains("sha1") {
            return Ok(Outcome::Affected(0));
        }

        let key = (
            text(params, 0)?,
            text(params, 1)?,
            text(params, 2)?,
            text(params, 3)?,
        );
        let before = rows.len();
        rows.retain(|r| {
            (&r.area_type, &r.area_name, &r.migration_name, &r.sha1)
                != (&key.0, &key.1, &key.2, &key.3)
        });
        return Ok(Outcome::Affected((before - rows.len()) as u64));
    }

    if norm.starts_with("select ") && norm.contains("sha1") && norm.contains("run_at") {
        let table = norm
            .split_once(" from ")
            .map(|(_, rest)| qualified(rest))
            .unwrap_or_default();
        let rows = state
            .tables
            .get(&table)
            .ok_or_else(|| error(format!("relation \"{}\" does not exist", table)))?;
        let area = (text(params, 0)?, text(params, 1)?);

        let mut selected: Vec<&LedgerRecord> = rows
            .iter()
            .filter(|r| r.area_type == area.0 && r.area_name == area.1)
            .collect();
        selected.sort_by(|a, b| {
            b.run_at
                .cmp(&a.run_at)
                .then_with(|| b.migration_name.cmp(&a.migration_name))
        });

        return Ok(Outcome::Rows(
            selected
                .into_iter()
                .map(|r| {
                    MemoryRow(vec![
                        ("area_type".to_string(), r.area_type.clone().into()),
                        ("area_name".to_string(), r.area_name.clone().into()),
                        ("migration_name".to_string(), r.migration_name.clone().into()),
                        ("sha1".to_string(), r.sha1.clone().into()),
                        ("run_at".to_string(), r.run_at.into()),
                    ])
                })
                .collect(),
        ));
    }

    Ok(Outcome::Affected(0))
}

/// Row made of named values
#[derive(Debug, Clone)]
pub struct MemoryRow(pub Vec<(String, DatabaseValue)>);

impl DatabaseRow for MemoryRow {
    fn get_by_index(&self, index: usize) -> OrmResult<DatabaseValue> {
        self.0
            .get(index)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| OrmError::ColumnNotFound(index.to_string()))
    }

    fn get_by_name(&self, name: &str) -> OrmResult<DatabaseValue> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| OrmError::ColumnNotFound(name.to_string()))
    }

    fn column_count(&self) -> usize {
        self.0.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.0.iter().map(|(n, _)| n.clone()).collect()
    }
}

/// Connection with canned answers, for handle-level tests
pub struct ScriptedConnection {
    affected: u64,
    rows: Vec<String>,
    log: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedConnection {
    /// Every statement reports `affected` rows
    pub fn affecting(affected: u64) -> Self {
        Self {
            affected,
            rows: Vec::new(),
            log: Arc::default(),
            closed: Arc::default(),
        }
    }

    /// Every query returns one `migration_name` row per entry
    pub fn returning(names: Vec<&str>) -> Self {
        Self {
            rows: names.into_iter().map(str::to_string).collect(),
            ..Self::affecting(0)
        }
    }

    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

#[async_trait]
impl DatabaseConnection for ScriptedConnection {
    async fn execute(&mut self, sql: &str, _params: &[DatabaseValue]) -> OrmResult<u64> {
        self.log.lock().unwrap().push(sql.to_string());
        Ok(self.affected)
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        _params: &[DatabaseValue],
    ) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        self.log.lock().unwrap().push(sql.to_string());
        Ok(self
            .rows
            .iter()
            .map(|name| {
                Box::new(MemoryRow(vec![(
                    "migration_name".to_string(),
                    name.clone().into(),
                )])) as Box<dyn DatabaseRow>
            })
            .collect())
    }

    async fn close(self: Box<Self>) -> OrmResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
