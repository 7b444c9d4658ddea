//! In-memory OVSDB server
//!
//! Implements [`Transport`] directly, executing insert/select/delete/mutate
//! against a copy of its tables and committing only if every operation
//! succeeded. Like `ovsdb-server` it resolves named UUIDs, enforces unique
//! bridge/port/interface names at commit, garbage-collects rows that are no
//! longer referenced from the root table, and reports each commit to its
//! monitors as an `update` notification.

use async_trait::async_trait;
use ovs_ovsdb::operation::{Condition, Function, Mutation, Mutator, MONITORED_TABLES};
use ovs_ovsdb::{
    Atom, ClientOptions, Datum, Operation, OperationResult, OvsdbClient, OvsdbError, OvsdbResult,
    Row, RowUpdate, TableUpdates, Transport, UpdateReceiver, Vsctl, BRIDGE_TABLE,
    INTERFACE_TABLE, PORT_TABLE, ROOT_TABLE,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::fake_host::FakeHost;

type Tables = HashMap<String, BTreeMap<Uuid, Row>>;

/// Reference columns followed when collecting unreachable rows.
const REFERENCES: &[(&str, &str, &str)] = &[
    (ROOT_TABLE, "bridges", BRIDGE_TABLE),
    (BRIDGE_TABLE, "ports", PORT_TABLE),
    (PORT_TABLE, "interfaces", INTERFACE_TABLE),
];

/// Tables whose `name` column is a unique index.
const UNIQUE_NAME_TABLES: &[&str] = &[BRIDGE_TABLE, PORT_TABLE, INTERFACE_TABLE];

#[derive(Default)]
struct DbState {
    tables: Tables,
    monitors: Vec<mpsc::UnboundedSender<TableUpdates>>,
    /// (op, table) pairs rejected with an error
    failing: HashSet<(String, String)>,
    truncate_next: Option<usize>,
    log: Vec<Vec<Operation>>,
}

/// In-memory stand-in for `ovsdb-server` holding the `Open_vSwitch` database.
pub struct FakeOvsdb {
    state: Mutex<DbState>,
    notify_delay: Mutex<Duration>,
    host: Option<FakeHost>,
}

impl FakeOvsdb {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Creates and removes a host link whenever an `internal` Interface row
    /// is committed or collected, the way `ovs-vswitchd` does.
    pub fn with_host(host: FakeHost) -> Arc<Self> {
        Self::build(Some(host))
    }

    fn build(host: Option<FakeHost>) -> Arc<Self> {
        let mut state = DbState::default();
        for table in MONITORED_TABLES {
            state.tables.insert(table.to_string(), BTreeMap::new());
        }
        let root = Row::new()
            .with("ovs_version", "3.1.0")
            .with("bridges", Datum::empty());
        if let Some(rows) = state.tables.get_mut(ROOT_TABLE) {
            rows.insert(Uuid::new_v4(), root);
        }
        Arc::new(Self {
            state: Mutex::new(state),
            notify_delay: Mutex::new(Duration::ZERO),
            host,
        })
    }

    /// Opens a client over this server with fast root-row polling and an
    /// `ovs-vsctl` stand-in that always fails.
    pub async fn client(self: &Arc<Self>) -> OvsdbClient {
        self.client_with_vsctl(Vsctl::new("false")).await
    }

    pub async fn client_with_vsctl(self: &Arc<Self>, vsctl: Vsctl) -> OvsdbClient {
        let options = ClientOptions {
            root_wait_attempts: 10,
            root_wait_interval: Duration::from_millis(5),
            vsctl,
        };
        let (transport, updates) = self.connect();
        OvsdbClient::from_transport(transport, updates, options)
            .await
            .expect("fake OVSDB always has a root row")
    }

    /// Transport handle plus its notification stream.
    pub fn connect(self: &Arc<Self>) -> (Arc<dyn Transport>, UpdateReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = FakeConnection {
            db: Arc::clone(self),
            updates: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        };
        (Arc::new(connection), rx)
    }

    /// Delays every notification, widening the window in which a client's
    /// cache trails a commit.
    pub fn set_notify_delay(&self, delay: Duration) {
        *self.notify_delay.lock() = delay;
    }

    /// Rejects every `op` on `table` (e.g. `("delete", "Bridge")`).
    pub fn fail_op(&self, op: &str, table: &str) {
        self.state
            .lock()
            .failing
            .insert((op.to_string(), table.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Answers the next transaction with only `n` result elements.
    pub fn truncate_next_reply(&self, n: usize) {
        self.state.lock().truncate_next = Some(n);
    }

    pub fn rows(&self, table: &str) -> Vec<(Uuid, Row)> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|(u, r)| (*u, r.clone())).collect())
            .unwrap_or_default()
    }

    pub fn row_by_name(&self, table: &str, name: &str) -> Option<(Uuid, Row)> {
        self.rows(table)
            .into_iter()
            .find(|(_, row)| row.name() == Some(name))
    }

    /// Every transaction received, in order.
    pub fn transactions(&self) -> Vec<Vec<Operation>> {
        self.state.lock().log.clone()
    }

    fn transact(&self, ops: &[Operation]) -> OvsdbResult<Vec<OperationResult>> {
        let mut state = self.state.lock();
        state.log.push(ops.to_vec());

        let mut scratch = state.tables.clone();
        let mut named: HashMap<String, Uuid> = HashMap::new();
        let mut results = Vec::with_capacity(ops.len());
        let mut failed = false;

        for op in ops {
            if failed {
                results.push(OperationResult::default());
                continue;
            }
            let kind = op_name(op);
            let result = if state
                .failing
                .contains(&(kind.to_string(), op.table().to_string()))
            {
                OperationResult::with_error("injected failure", format!("{} on {}", kind, op.table()))
            } else {
                execute(&mut scratch, &mut named, op)
                    .unwrap_or_else(|details| OperationResult::with_error("constraint violation", details))
            };
            failed = result.error.is_some();
            results.push(result);
        }

        if !failed {
            collect_garbage(&mut scratch);
            match check_unique_names(&scratch) {
                Ok(()) => {
                    let updates = diff(&state.tables, &scratch);
                    let old = std::mem::replace(&mut state.tables, scratch);
                    self.sync_host(&old, &state.tables);
                    self.notify(&mut state, updates);
                }
                Err(details) => {
                    results.push(OperationResult::with_error("constraint violation", details));
                }
            }
        }

        if let Some(n) = state.truncate_next.take() {
            results.truncate(n);
        }
        Ok(results)
    }

    fn monitor(&self, tables: &[&str], tx: mpsc::UnboundedSender<TableUpdates>) -> OvsdbResult<TableUpdates> {
        let mut state = self.state.lock();
        let mut snapshot = TableUpdates::new();
        for table in tables {
            if let Some(rows) = state.tables.get(*table) {
                for (uuid, row) in rows {
                    snapshot.push(*table, *uuid, RowUpdate::insert(row.clone()));
                }
            }
        }
        state.monitors.push(tx);
        Ok(snapshot)
    }

    fn notify(&self, state: &mut DbState, updates: TableUpdates) {
        if updates.is_empty() {
            return;
        }
        let delay = *self.notify_delay.lock();
        state.monitors.retain(|tx| !tx.is_closed());
        for tx in &state.monitors {
            if delay.is_zero() {
                let _ = tx.send(updates.clone());
            } else {
                let (tx, batch) = (tx.clone(), updates.clone());
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(batch);
                });
            }
        }
    }

    fn sync_host(&self, old: &Tables, new: &Tables) {
        let Some(host) = &self.host else { return };
        let names = |tables: &Tables| -> HashSet<String> {
            tables
                .get(INTERFACE_TABLE)
                .map(|rows| {
                    rows.values()
                        .filter(|r| r.get_str("type") == Some("internal"))
                        .filter_map(|r| r.name().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let (before, after) = (names(old), names(new));
        for name in after.difference(&before) {
            debug!(device = %name, "Fake vswitchd created internal device");
            host.add_down_link(name);
        }
        for name in before.difference(&after) {
            debug!(device = %name, "Fake vswitchd removed internal device");
            host.remove_link(name);
        }
    }
}

/// One client connection. The notification sender moves to the server
/// on `monitor`.
struct FakeConnection {
    db: Arc<FakeOvsdb>,
    updates: Mutex<Option<mpsc::UnboundedSender<TableUpdates>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for FakeConnection {
    async fn transact(&self, _db: &str, ops: &[Operation]) -> OvsdbResult<Vec<OperationResult>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OvsdbError::Disconnected);
        }
        self.db.transact(ops)
    }

    async fn monitor(&self, _db: &str, tables: &[&str]) -> OvsdbResult<TableUpdates> {
        let tx = self
            .updates
            .lock()
            .take()
            .ok_or_else(|| OvsdbError::protocol("monitor already started"))?;
        self.db.monitor(tables, tx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.updates.lock().take();
    }
}

fn op_name(op: &Operation) -> &'static str {
    match op {
        Operation::Insert { .. } => "insert",
        Operation::Select { .. } => "select",
        Operation::Delete { .. } => "delete",
        Operation::Mutate { .. } => "mutate",
    }
}

fn execute(
    tables: &mut Tables,
    named: &mut HashMap<String, Uuid>,
    op: &Operation,
) -> Result<OperationResult, String> {
    match op {
        Operation::Insert {
            table,
            row,
            uuid_name,
        } => {
            let rows = tables
                .get_mut(table)
                .ok_or_else(|| format!("no table {}", table))?;
            let uuid = Uuid::new_v4();
            if let Some(name) = uuid_name {
                named.insert(name.clone(), uuid);
            }
            let resolved = row
                .columns()
                .map(|(c, d)| Ok((c.clone(), resolve(d, named)?)))
                .collect::<Result<Row, String>>()?;
            rows.insert(uuid, resolved);
            Ok(OperationResult {
                uuid: Some(Datum::from(uuid)),
                ..Default::default()
            })
        }
        Operation::Select {
            table,
            conditions,
            columns,
        } => {
            let rows = tables
                .get(table)
                .ok_or_else(|| format!("no table {}", table))?;
            let selected = rows
                .iter()
                .filter(|(u, r)| matches_all(u, r, conditions))
                .map(|(u, r)| project(u, r, columns.as_deref()))
                .collect();
            Ok(OperationResult {
                rows: Some(selected),
                ..Default::default()
            })
        }
        Operation::Delete { table, conditions } => {
            let rows = tables
                .get_mut(table)
                .ok_or_else(|| format!("no table {}", table))?;
            let before = rows.len();
            rows.retain(|u, r| !matches_all(u, r, conditions));
            Ok(count(before - rows.len()))
        }
        Operation::Mutate {
            table,
            conditions,
            mutations,
        } => {
            let rows = tables
                .get_mut(table)
                .ok_or_else(|| format!("no table {}", table))?;
            let mut matched = 0;
            for (uuid, row) in rows.iter_mut() {
                if !matches_all(uuid, row, conditions) {
                    continue;
                }
                matched += 1;
                for m in mutations {
                    apply_mutation(row, m, named)?;
                }
            }
            Ok(count(matched))
        }
    }
}

fn count(n: usize) -> OperationResult {
    OperationResult {
        count: Some(n as u64),
        ..Default::default()
    }
}

fn resolve(datum: &Datum, named: &HashMap<String, Uuid>) -> Result<Datum, String> {
    let atom = |a: &Atom| match a {
        Atom::NamedUuid(n) => named
            .get(n)
            .map(|u| Atom::Uuid(*u))
            .ok_or_else(|| format!("unknown named-uuid {}", n)),
        other => Ok(other.clone()),
    };
    Ok(match datum {
        Datum::Atom(a) => Datum::Atom(atom(a)?),
        Datum::Set(items) => Datum::Set(items.iter().map(atom).collect::<Result<_, _>>()?),
        Datum::Map(pairs) => Datum::Map(
            pairs
                .iter()
                .map(|(k, v)| Ok((atom(k)?, atom(v)?)))
                .collect::<Result<_, String>>()?,
        ),
    })
}

fn matches_all(uuid: &Uuid, row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|c| {
        let equal = if c.column == "_uuid" {
            c.value.as_uuid() == Some(*uuid)
        } else {
            row.get(&c.column).map(Datum::atoms) == Some(c.value.atoms())
        };
        match c.function {
            Function::Equal => equal,
            Function::NotEqual => !equal,
        }
    })
}

fn project(uuid: &Uuid, row: &Row, columns: Option<&[String]>) -> Row {
    let mut out = match columns {
        Some(cols) => cols
            .iter()
            .filter_map(|c| row.get(c).map(|d| (c.clone(), d.clone())))
            .collect(),
        None => row.clone(),
    };
    if columns.map_or(true, |cols| cols.iter().any(|c| c == "_uuid")) {
        out.insert("_uuid", *uuid);
    }
    out
}

fn apply_mutation(row: &mut Row, m: &Mutation, named: &HashMap<String, Uuid>) -> Result<(), String> {
    let value = resolve(&m.value, named)?;
    let mut current: Vec<Atom> = row
        .get(&m.column)
        .map(|d| d.atoms().into_iter().cloned().collect())
        .unwrap_or_default();
    for atom in value.atoms() {
        match m.mutator {
            Mutator::Insert => {
                if !current.contains(atom) {
                    current.push(atom.clone());
                }
            }
            Mutator::Delete => current.retain(|a| a != atom),
        }
    }
    row.insert(m.column.clone(), Datum::Set(current));
    Ok(())
}

/// Drops rows not reachable from the root table.
fn collect_garbage(tables: &mut Tables) {
    for (parent, column, child) in REFERENCES {
        let referenced: HashSet<Uuid> = tables
            .get(*parent)
            .map(|rows| {
                rows.values()
                    .filter_map(|r| r.get(column))
                    .flat_map(Datum::uuids)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(rows) = tables.get_mut(*child) {
            rows.retain(|uuid, _| referenced.contains(uuid));
        }
    }
}

fn check_unique_names(tables: &Tables) -> Result<(), String> {
    for table in UNIQUE_NAME_TABLES {
        let mut seen = HashSet::new();
        for row in tables.get(*table).into_iter().flat_map(BTreeMap::values) {
            if let Some(name) = row.name() {
                if !seen.insert(name) {
                    return Err(format!(
                        "Transaction causes multiple rows in \"{}\" table to have identical values ({}) for index on column \"name\"",
                        table, name
                    ));
                }
            }
        }
    }
    Ok(())
}

fn diff(old: &Tables, new: &Tables) -> TableUpdates {
    let mut updates = TableUpdates::new();
    for (table, new_rows) in new {
        let old_rows = old.get(table);
        for (uuid, row) in new_rows {
            let previous = old_rows.and_then(|rows| rows.get(uuid));
            if previous != Some(row) {
                updates.push(
                    table.clone(),
                    *uuid,
                    RowUpdate {
                        old: previous.cloned(),
                        new: Some(row.clone()),
                    },
                );
            }
        }
        if let Some(old_rows) = old_rows {
            for (uuid, row) in old_rows {
                if !new_rows.contains_key(uuid) {
                    updates.push(table.clone(), *uuid, RowUpdate::delete(row.clone()));
                }
            }
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovs_ovsdb::{Transaction, BRIDGE_TABLE};
    use pretty_assertions::assert_eq;

    fn bridge_txn(name: &str, root: Uuid) -> Transaction {
        ovs_ovsdb::bridge::create_bridge_transaction(name, None, root)
    }

    fn root(db: &FakeOvsdb) -> Uuid {
        db.rows(ROOT_TABLE)[0].0
    }

    #[test]
    fn test_insert_resolves_named_uuids() {
        let db = FakeOvsdb::new();
        let results = db.transact(bridge_txn("ovs0", root(&db)).operations()).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.error.is_none()));

        let (port_uuid, _) = db.row_by_name(PORT_TABLE, "ovs0").unwrap();
        let (_, bridge) = db.row_by_name(BRIDGE_TABLE, "ovs0").unwrap();
        assert_eq!(bridge.get("ports").unwrap().uuids(), vec![port_uuid]);
        assert_eq!(db.rows(ROOT_TABLE)[0].1.get("bridges").unwrap().uuids().len(), 1);
    }

    #[test]
    fn test_duplicate_name_fails_commit() {
        let db = FakeOvsdb::new();
        db.transact(bridge_txn("ovs0", root(&db)).operations()).unwrap();
        let results = db.transact(bridge_txn("ovs0", root(&db)).operations()).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results[4].error_message().unwrap().contains("identical values"));
        assert_eq!(db.rows(BRIDGE_TABLE).len(), 1);
    }

    #[test]
    fn test_unreferenced_rows_are_collected() {
        let db = FakeOvsdb::new();
        let orphan = Transaction::new().with(Operation::insert(
            PORT_TABLE,
            Row::new().with("name", "lost"),
            "p",
        ));
        let results = db.transact(orphan.operations()).unwrap();
        assert!(results[0].uuid.is_some());
        assert!(db.rows(PORT_TABLE).is_empty());
    }

    #[test]
    fn test_failed_operation_rolls_back_and_nulls_the_rest() {
        let db = FakeOvsdb::new();
        db.fail_op("insert", BRIDGE_TABLE);
        let results = db.transact(bridge_txn("ovs0", root(&db)).operations()).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results[2].error.is_some());
        assert_eq!(results[3], OperationResult::default());
        assert!(db.rows(INTERFACE_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_monitor_receives_commits() {
        let db = FakeOvsdb::new();
        let (transport, mut updates) = db.connect();
        let snapshot = transport.monitor("Open_vSwitch", MONITORED_TABLES).await.unwrap();
        assert_eq!(snapshot.0[ROOT_TABLE].len(), 1);

        db.transact(bridge_txn("ovs0", root(&db)).operations()).unwrap();
        let batch = updates.recv().await.unwrap();
        assert_eq!(batch.0[BRIDGE_TABLE].len(), 1);
        assert_eq!(batch.0[INTERFACE_TABLE].len(), 1);
    }

    #[test]
    fn test_internal_interfaces_appear_on_host() {
        let host = FakeHost::new();
        let db = FakeOvsdb::with_host(host.clone());
        db.transact(bridge_txn("ovs0", root(&db)).operations()).unwrap();
        assert!(host.link("ovs0").is_some());

        let remove = ovs_ovsdb::bridge::remove_bridge_transaction(
            "ovs0",
            &[db.row_by_name(BRIDGE_TABLE, "ovs0").unwrap().0],
            root(&db),
        );
        db.transact(remove.operations()).unwrap();
        assert!(host.link("ovs0").is_none());
        assert!(db.rows(INTERFACE_TABLE).is_empty());
    }
}
