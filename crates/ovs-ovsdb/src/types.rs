//! OVSDB wire values (RFC 7047 section 5.1).
//!
//! | JSON | Rust |
//! |------|------|
//! | `"s"`, `1`, `1.5`, `true` | [`Atom`] scalar variants |
//! | `["uuid", "…"]` | [`Atom::Uuid`] |
//! | `["named-uuid", "…"]` | [`Atom::NamedUuid`] |
//! | `["set", [...]]` | [`Datum::Set`] |
//! | `["map", [[k, v], ...]]` | [`Datum::Map`] |

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// A single OVSDB scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Uuid(Uuid),
    /// Placeholder for a row inserted earlier in the same transaction.
    NamedUuid(String),
}

impl Atom {
    pub fn string(s: impl Into<String>) -> Self {
        Atom::String(s.into())
    }

    pub fn named(s: impl Into<String>) -> Self {
        Atom::NamedUuid(s.into())
    }

    pub fn to_json(&self) -> Value {
        match self {
            Atom::String(s) => Value::String(s.clone()),
            Atom::Integer(i) => json!(i),
            Atom::Real(r) => json!(r),
            Atom::Boolean(b) => Value::Bool(*b),
            Atom::Uuid(u) => json!(["uuid", u.to_string()]),
            Atom::NamedUuid(n) => json!(["named-uuid", n]),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(Atom::String(s.clone())),
            Value::Bool(b) => Ok(Atom::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Atom::Integer(i)),
                None => n
                    .as_f64()
                    .map(Atom::Real)
                    .ok_or_else(|| format!("unrepresentable number {}", n)),
            },
            Value::Array(parts) => match parts.as_slice() {
                [Value::String(tag), Value::String(id)] if tag == "uuid" => Uuid::parse_str(id)
                    .map(Atom::Uuid)
                    .map_err(|e| format!("bad uuid {}: {}", id, e)),
                [Value::String(tag), Value::String(id)] if tag == "named-uuid" => {
                    Ok(Atom::NamedUuid(id.clone()))
                }
                _ => Err(format!("not an atom: {}", value)),
            },
            _ => Err(format!("not an atom: {}", value)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Atom::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Self {
        Atom::String(s.to_string())
    }
}

impl From<String> for Atom {
    fn from(s: String) -> Self {
        Atom::String(s)
    }
}

impl From<i64> for Atom {
    fn from(i: i64) -> Self {
        Atom::Integer(i)
    }
}

impl From<bool> for Atom {
    fn from(b: bool) -> Self {
        Atom::Boolean(b)
    }
}

impl From<Uuid> for Atom {
    fn from(u: Uuid) -> Self {
        Atom::Uuid(u)
    }
}

/// A column value: a scalar, a set of scalars, or a map.
///
/// A one-element set and its bare atom are the same value on the wire;
/// [`Datum::atoms`] treats them uniformly.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Atom(Atom),
    Set(Vec<Atom>),
    Map(Vec<(Atom, Atom)>),
}

impl Datum {
    pub fn set<I, A>(items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Atom>,
    {
        Datum::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Atom>,
        V: Into<Atom>,
    {
        Datum::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Empty set, the OVSDB spelling of "no value" for optional columns.
    pub fn empty() -> Self {
        Datum::Set(Vec::new())
    }

    pub fn to_json(&self) -> Value {
        match self {
            Datum::Atom(a) => a.to_json(),
            Datum::Set(items) => {
                json!(["set", items.iter().map(Atom::to_json).collect::<Vec<_>>()])
            }
            Datum::Map(pairs) => json!([
                "map",
                pairs
                    .iter()
                    .map(|(k, v)| json!([k.to_json(), v.to_json()]))
                    .collect::<Vec<_>>()
            ]),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, String> {
        if let Value::Array(parts) = value {
            match parts.as_slice() {
                [Value::String(tag), Value::Array(items)] if tag == "set" => {
                    let atoms = items
                        .iter()
                        .map(Atom::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Datum::Set(atoms));
                }
                [Value::String(tag), Value::Array(pairs)] if tag == "map" => {
                    let mut out = Vec::with_capacity(pairs.len());
                    for pair in pairs {
                        match pair.as_array().map(Vec::as_slice) {
                            Some([k, v]) => out.push((Atom::from_json(k)?, Atom::from_json(v)?)),
                            _ => return Err(format!("bad map pair: {}", pair)),
                        }
                    }
                    return Ok(Datum::Map(out));
                }
                _ => {}
            }
        }
        Atom::from_json(value).map(Datum::Atom)
    }

    /// Atoms of a scalar or set; keys of a map.
    pub fn atoms(&self) -> Vec<&Atom> {
        match self {
            Datum::Atom(a) => vec![a],
            Datum::Set(items) => items.iter().collect(),
            Datum::Map(pairs) => pairs.iter().map(|(k, _)| k).collect(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Atom(a) => a.as_str(),
            Datum::Set(items) if items.len() == 1 => items[0].as_str(),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Datum::Atom(a) => a.as_uuid(),
            Datum::Set(items) if items.len() == 1 => items[0].as_uuid(),
            _ => None,
        }
    }

    /// Every UUID referenced by a scalar or set column.
    pub fn uuids(&self) -> Vec<Uuid> {
        self.atoms().into_iter().filter_map(Atom::as_uuid).collect()
    }

    /// Value for `key` in a map column.
    pub fn map_get(&self, key: &str) -> Option<&Atom> {
        match self {
            Datum::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

macro_rules! datum_from_scalar {
    ($($t:ty),*) => {
        $(impl From<$t> for Datum {
            fn from(v: $t) -> Self {
                Datum::Atom(v.into())
            }
        })*
    };
}

datum_from_scalar!(&str, String, i64, bool, Uuid);

impl From<Atom> for Datum {
    fn from(a: Atom) -> Self {
        Datum::Atom(a)
    }
}

impl Serialize for Datum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Datum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Datum::from_json(&value).map_err(D::Error::custom)
    }
}

/// Column name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Datum>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Datum>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Datum>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.0.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Datum::as_str)
    }

    /// The `name` column most OVS tables are keyed by.
    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Datum)> {
        self.0.iter()
    }

    pub fn remove(&mut self, column: &str) -> Option<Datum> {
        self.0.remove(column)
    }
}

impl FromIterator<(String, Datum)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Datum)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

/// Old/new images of one row in an `update` notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
}

impl RowUpdate {
    pub fn insert(row: Row) -> Self {
        Self {
            old: None,
            new: Some(row),
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    /// An absent or empty `new` image removes the row.
    pub fn is_delete(&self) -> bool {
        self.new.as_ref().map_or(true, Row::is_empty)
    }
}

/// Row changes for one table, keyed by row UUID.
pub type TableUpdate = HashMap<Uuid, RowUpdate>;

/// Row changes keyed by table name; the payload of `monitor` replies and
/// `update` notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableUpdates(pub HashMap<String, TableUpdate>);

impl TableUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: impl Into<String>, uuid: Uuid, update: RowUpdate) {
        self.0.entry(table.into()).or_default().insert(uuid, update);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(HashMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_atom_wire_forms() {
        let u = Uuid::parse_str("36b1e8a2-6c9d-4b6e-9a4f-0d8c5e2f1a77").unwrap();
        assert_eq!(Atom::Uuid(u).to_json(), json!(["uuid", u.to_string()]));
        assert_eq!(
            Atom::named("new_port").to_json(),
            json!(["named-uuid", "new_port"])
        );
        assert_eq!(Atom::from_json(&json!(42)).unwrap(), Atom::Integer(42));
        assert_eq!(Atom::from_json(&json!(1.5)).unwrap(), Atom::Real(1.5));
    }

    #[test]
    fn test_datum_set_and_map() {
        let protocols = Datum::set(["OpenFlow10", "OpenFlow13"]);
        assert_eq!(
            protocols.to_json(),
            json!(["set", ["OpenFlow10", "OpenFlow13"]])
        );

        let options = Datum::map([("remote_ip", "192.0.2.7")]);
        assert_eq!(options.to_json(), json!(["map", [["remote_ip", "192.0.2.7"]]]));
        assert_eq!(
            options.map_get("remote_ip"),
            Some(&Atom::string("192.0.2.7"))
        );
    }

    #[test]
    fn test_single_element_set_reads_as_scalar() {
        let u = Uuid::new_v4();
        let d = Datum::from_json(&json!(["set", [["uuid", u.to_string()]]])).unwrap();
        assert_eq!(d.as_uuid(), Some(u));
        assert_eq!(d.uuids(), vec![u]);
    }

    #[test]
    fn test_empty_set_is_not_a_string() {
        let d = Datum::from_json(&json!(["set", []])).unwrap();
        assert_eq!(d, Datum::empty());
        assert_eq!(d.as_str(), None);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Datum::from_json(&json!(null)).is_err());
        assert!(Datum::from_json(&json!(["uuid", "not-a-uuid"])).is_err());
        assert!(Datum::from_json(&json!(["map", [["only-key"]]])).is_err());
    }

    #[test]
    fn test_table_updates_deserialize() {
        let u = Uuid::new_v4();
        let raw = format!(
            r#"{{"Bridge": {{"{}": {{"new": {{"name": "ovs0", "ports": ["set", []]}}}}}}}}"#,
            u
        );
        let updates: TableUpdates = serde_json::from_str(&raw).unwrap();
        let row = &updates.0["Bridge"][&u];
        assert!(!row.is_delete());
        assert_eq!(row.new.as_ref().and_then(Row::name), Some("ovs0"));
    }

    #[test]
    fn test_row_update_delete_forms() {
        assert!(RowUpdate::delete(Row::new().with("name", "p1")).is_delete());
        assert!(RowUpdate {
            old: None,
            new: Some(Row::new())
        }
        .is_delete());
    }
}
