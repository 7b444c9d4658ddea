//! Transaction operations and their results (RFC 7047 section 5.2).

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::types::{Datum, Row};

/// The OVS configuration database.
pub const DATABASE: &str = "Open_vSwitch";

/// Singleton root table; its `bridges` column owns every bridge.
pub const ROOT_TABLE: &str = "Open_vSwitch";
pub const BRIDGE_TABLE: &str = "Bridge";
pub const PORT_TABLE: &str = "Port";
pub const INTERFACE_TABLE: &str = "Interface";

/// Tables mirrored into the local cache.
pub const MONITORED_TABLES: &[&str] = &[ROOT_TABLE, BRIDGE_TABLE, PORT_TABLE, INTERFACE_TABLE];

/// Comparison used in a `where` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Equal,
    NotEqual,
}

impl Function {
    pub fn as_str(&self) -> &'static str {
        match self {
            Function::Equal => "==",
            Function::NotEqual => "!=",
        }
    }
}

/// `[column, function, value]`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub function: Function,
    pub value: Datum,
}

impl Condition {
    pub fn equal(column: impl Into<String>, value: impl Into<Datum>) -> Self {
        Self {
            column: column.into(),
            function: Function::Equal,
            value: value.into(),
        }
    }

    /// `name == <name>`
    pub fn name_is(name: &str) -> Self {
        Self::equal("name", name)
    }

    /// `_uuid == <uuid>`
    pub fn uuid_is(uuid: Uuid) -> Self {
        Self::equal("_uuid", uuid)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut t = serializer.serialize_tuple(3)?;
        t.serialize_element(&self.column)?;
        t.serialize_element(self.function.as_str())?;
        t.serialize_element(&self.value)?;
        t.end()
    }
}

/// Set mutators; only the two bridge/port membership edits are needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutator {
    Insert,
    Delete,
}

impl Mutator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mutator::Insert => "insert",
            Mutator::Delete => "delete",
        }
    }
}

/// `[column, mutator, value]`
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub column: String,
    pub mutator: Mutator,
    pub value: Datum,
}

impl Mutation {
    pub fn insert(column: impl Into<String>, value: Datum) -> Self {
        Self {
            column: column.into(),
            mutator: Mutator::Insert,
            value,
        }
    }

    pub fn delete(column: impl Into<String>, value: Datum) -> Self {
        Self {
            column: column.into(),
            mutator: Mutator::Delete,
            value,
        }
    }
}

impl Serialize for Mutation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut t = serializer.serialize_tuple(3)?;
        t.serialize_element(&self.column)?;
        t.serialize_element(self.mutator.as_str())?;
        t.serialize_element(&self.value)?;
        t.end()
    }
}

/// One statement of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        table: String,
        row: Row,
        #[serde(rename = "uuid-name", skip_serializing_if = "Option::is_none")]
        uuid_name: Option<String>,
    },
    Select {
        table: String,
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
        #[serde(skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
    },
    Delete {
        table: String,
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
    },
    Mutate {
        table: String,
        #[serde(rename = "where")]
        conditions: Vec<Condition>,
        mutations: Vec<Mutation>,
    },
}

impl Operation {
    pub fn insert(table: &str, row: Row, uuid_name: &str) -> Self {
        Operation::Insert {
            table: table.to_string(),
            row,
            uuid_name: Some(uuid_name.to_string()),
        }
    }

    pub fn select(table: &str, conditions: Vec<Condition>) -> Self {
        Operation::Select {
            table: table.to_string(),
            conditions,
            columns: None,
        }
    }

    pub fn select_columns(table: &str, conditions: Vec<Condition>, columns: &[&str]) -> Self {
        Operation::Select {
            table: table.to_string(),
            conditions,
            columns: Some(columns.iter().map(|c| c.to_string()).collect()),
        }
    }

    pub fn delete(table: &str, conditions: Vec<Condition>) -> Self {
        Operation::Delete {
            table: table.to_string(),
            conditions,
        }
    }

    pub fn mutate(table: &str, conditions: Vec<Condition>, mutations: Vec<Mutation>) -> Self {
        Operation::Mutate {
            table: table.to_string(),
            conditions,
            mutations,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Operation::Insert { table, .. }
            | Operation::Select { table, .. }
            | Operation::Delete { table, .. }
            | Operation::Mutate { table, .. } => table,
        }
    }
}

/// Per-operation reply. A `null` slot (operation skipped after an earlier
/// failure) decodes as the default, which carries no error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Datum>,
}

impl OperationResult {
    pub fn with_error(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            details: Some(details.into()),
            ..Default::default()
        }
    }

    /// `error(details)` when the server rejected this operation.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_deref() {
            Some(e) if !e.is_empty() => Some(format!(
                "{}({})",
                e,
                self.details.as_deref().unwrap_or_default()
            )),
            _ => None,
        }
    }

    pub fn rows(&self) -> &[Row] {
        self.rows.as_deref().unwrap_or_default()
    }
}

/// An ordered batch of operations submitted atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn push(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
