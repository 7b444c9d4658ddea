//! Local mirror of the monitored OVSDB tables.
//!
//! The cache is advisory: it lags the server by however long the `update`
//! notification for a commit takes to arrive. Anything a caller's
//! correctness depends on (existence after a write, UUIDs to delete) goes
//! through a Select instead.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::operation::ROOT_TABLE;
use crate::types::{Row, TableUpdates};

type Tables = HashMap<String, HashMap<Uuid, Row>>;

/// Table name to (row UUID to row).
///
/// One notification batch is applied under a single write lock, so readers
/// never observe half of an update.
#[derive(Debug, Default)]
pub struct TableCache {
    tables: RwLock<Tables>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole cache with an initial snapshot.
    pub fn seed(&self, snapshot: TableUpdates) {
        let mut tables = self.tables.write();
        tables.clear();
        apply_locked(&mut tables, snapshot);
    }

    /// Merges one notification: a non-empty `new` image replaces the row,
    /// anything else removes it.
    pub fn apply(&self, updates: TableUpdates) {
        let mut tables = self.tables.write();
        apply_locked(&mut tables, updates);
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    pub fn get(&self, table: &str, uuid: &Uuid) -> Option<Row> {
        self.tables.read().get(table)?.get(uuid).cloned()
    }

    /// First row of `table` matching `predicate`.
    pub fn find<F>(&self, table: &str, predicate: F) -> Option<(Uuid, Row)>
    where
        F: Fn(&Row) -> bool,
    {
        let tables = self.tables.read();
        tables
            .get(table)?
            .iter()
            .find(|(_, row)| predicate(row))
            .map(|(uuid, row)| (*uuid, row.clone()))
    }

    /// Every row of `table` matching `predicate`.
    pub fn find_all<F>(&self, table: &str, predicate: F) -> Vec<(Uuid, Row)>
    where
        F: Fn(&Row) -> bool,
    {
        let tables = self.tables.read();
        tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| predicate(row))
                    .map(|(uuid, row)| (*uuid, row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_uuid_by_name(&self, table: &str, name: &str) -> Option<Uuid> {
        self.find(table, |row| row.name() == Some(name))
            .map(|(uuid, _)| uuid)
    }

    /// UUID of the singleton `Open_vSwitch` row, once the snapshot has it.
    pub fn root_uuid(&self) -> Option<Uuid> {
        self.tables
            .read()
            .get(ROOT_TABLE)
            .and_then(|rows| rows.keys().next().copied())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, HashMap::len)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn apply_locked(tables: &mut Tables, updates: TableUpdates) {
    for (table, rows) in updates.0 {
        let cached = tables.entry(table).or_default();
        for (uuid, update) in rows {
            let is_delete = update.is_delete();
            match update.new {
                Some(row) if !is_delete => {
                    cached.insert(uuid, row);
                }
                _ => {
                    cached.remove(&uuid);
                }
            }
        }
    }
}
