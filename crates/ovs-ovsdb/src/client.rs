//! Transaction client with a locally mirrored table cache.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::TableCache;
use crate::error::{OvsdbError, OvsdbResult};
use crate::operation::{
    Condition, Operation, OperationResult, Transaction, DATABASE, MONITORED_TABLES,
};
use crate::transport::{Endpoint, JsonRpcTransport, Transport, UpdateReceiver};
use crate::types::Row;
use crate::vsctl::Vsctl;

/// Connection settings, the `[ovsdb]` section of the daemon config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OvsdbConfig {
    /// `unix:<path>` or `tcp:<host>:<port>`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between connect attempts in milliseconds
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,

    /// How many times to poll the cache for the root row after connecting
    #[serde(default = "default_root_wait_attempts")]
    pub root_wait_attempts: u32,

    #[serde(default = "default_root_wait_interval_ms")]
    pub root_wait_interval_ms: u64,

    /// Fallback tool for bridge/port create and delete
    #[serde(default = "default_vsctl_cmd")]
    pub vsctl_cmd: String,
}

fn default_endpoint() -> String {
    "unix:/var/run/openvswitch/db.sock".to_string()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_retry_ms() -> u64 {
    1000
}

fn default_root_wait_attempts() -> u32 {
    30
}

fn default_root_wait_interval_ms() -> u64 {
    1000
}

fn default_vsctl_cmd() -> String {
    ovs_cfgmgr_common::shell::OVS_VSCTL_CMD.to_string()
}

impl Default for OvsdbConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_attempts: default_connect_attempts(),
            connect_retry_ms: default_connect_retry_ms(),
            root_wait_attempts: default_root_wait_attempts(),
            root_wait_interval_ms: default_root_wait_interval_ms(),
            vsctl_cmd: default_vsctl_cmd(),
        }
    }
}

impl OvsdbConfig {
    /// Server reachable over TCP.
    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                host: host.to_string(),
                port,
            }
            .to_string(),
            ..Default::default()
        }
    }

    pub fn endpoint(&self) -> OvsdbResult<Endpoint> {
        self.endpoint.parse()
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            root_wait_attempts: self.root_wait_attempts,
            root_wait_interval: Duration::from_millis(self.root_wait_interval_ms),
            vsctl: Vsctl::new(self.vsctl_cmd.clone()),
        }
    }
}

/// Post-connect behaviour of [`OvsdbClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub root_wait_attempts: u32,
    pub root_wait_interval: Duration,
    pub vsctl: Vsctl,
}

impl Default for ClientOptions {
    fn default() -> Self {
        OvsdbConfig::default().client_options()
    }
}

/// Client for the `Open_vSwitch` database.
///
/// Owns the table cache for its connection: seeded from a full monitor
/// snapshot at construction, kept current by a background listener, and
/// cleared on [`disconnect`](Self::disconnect).
pub struct OvsdbClient {
    transport: Arc<dyn Transport>,
    cache: Arc<TableCache>,
    listener: Mutex<Option<JoinHandle<()>>>,
    vsctl: Vsctl,
}

impl OvsdbClient {
    /// Connects, retrying up to `connect_attempts` times.
    #[instrument(skip(config), fields(endpoint = %config.endpoint))]
    pub async fn connect(config: &OvsdbConfig) -> OvsdbResult<Self> {
        let endpoint = config.endpoint()?;
        let attempts = config.connect_attempts.max(1);
        let retry = Duration::from_millis(config.connect_retry_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match JsonRpcTransport::connect(&endpoint).await {
                Ok((transport, updates)) => {
                    info!(attempt, "Connected to OVSDB");
                    return Self::from_transport(
                        Arc::new(transport),
                        updates,
                        config.client_options(),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "OVSDB connect failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        }

        Err(OvsdbError::Connection {
            endpoint: endpoint.to_string(),
            attempts,
            message: last_error,
        })
    }

    /// Builds a client over an existing transport: seeds the cache, starts
    /// the update listener and waits for the root row.
    pub async fn from_transport(
        transport: Arc<dyn Transport>,
        updates: UpdateReceiver,
        options: ClientOptions,
    ) -> OvsdbResult<Self> {
        let cache = Arc::new(TableCache::new());
        let snapshot = transport.monitor(DATABASE, MONITORED_TABLES).await?;
        cache.seed(snapshot);

        let listener = tokio::spawn(listen(Arc::clone(&cache), updates));
        let client = Self {
            transport,
            cache,
            listener: Mutex::new(Some(listener)),
            vsctl: options.vsctl.clone(),
        };

        if let Err(e) = client.wait_for_root(&options).await {
            client.disconnect().await;
            return Err(e);
        }
        Ok(client)
    }

    async fn wait_for_root(&self, options: &ClientOptions) -> OvsdbResult<()> {
        let attempts = options.root_wait_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(root) = self.cache.root_uuid() {
                debug!(%root, "Root row present in cache");
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(options.root_wait_interval).await;
            }
        }
        Err(OvsdbError::RootNotFound { attempts })
    }

    pub fn cache(&self) -> &TableCache {
        &self.cache
    }

    pub fn vsctl(&self) -> &Vsctl {
        &self.vsctl
    }

    pub fn root_uuid(&self) -> OvsdbResult<Uuid> {
        self.cache
            .root_uuid()
            .ok_or(OvsdbError::RootNotFound { attempts: 0 })
    }

    /// Submits `txn` and checks the reply.
    ///
    /// Fails with [`OvsdbError::ReplyMismatch`] on a short reply and with
    /// [`OvsdbError::Transaction`] carrying every per-operation error
    /// otherwise. Never retries.
    pub async fn transact(&self, txn: &Transaction) -> OvsdbResult<Vec<OperationResult>> {
        if txn.is_empty() {
            return Ok(Vec::new());
        }

        let results = self
            .transport
            .transact(DATABASE, txn.operations())
            .await?;

        if results.len() < txn.len() {
            return Err(OvsdbError::ReplyMismatch {
                expected: txn.len(),
                actual: results.len(),
            });
        }

        let errors: Vec<String> = results
            .iter()
            .filter_map(OperationResult::error_message)
            .collect();
        if !errors.is_empty() {
            debug!(?errors, "Transaction rejected");
            return Err(OvsdbError::Transaction(errors));
        }

        Ok(results)
    }

    async fn select_one(&self, op: Operation) -> OvsdbResult<Vec<Row>> {
        let results = self.transact(&Transaction::new().with(op)).await?;
        Ok(results
            .into_iter()
            .next()
            .and_then(|r| r.rows)
            .unwrap_or_default())
    }

    /// Rows of `table` whose `name` equals `name`, straight from the server.
    pub async fn select_by_name(&self, table: &str, name: &str) -> OvsdbResult<Vec<Row>> {
        self.select_one(Operation::select(table, vec![Condition::name_is(name)]))
            .await
    }

    /// True if at least one row of `table` is named `name`.
    pub async fn exists(&self, table: &str, name: &str) -> OvsdbResult<bool> {
        Ok(!self.select_by_name(table, name).await?.is_empty())
    }

    /// UUIDs of the rows of `table` named `name`, resolved by the server.
    pub async fn select_uuids(&self, table: &str, name: &str) -> OvsdbResult<Vec<Uuid>> {
        let rows = self
            .select_one(Operation::select_columns(
                table,
                vec![Condition::name_is(name)],
                &["_uuid"],
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("_uuid").and_then(|d| d.as_uuid()))
            .collect())
    }

    /// Stops the listener, closes the connection and empties the cache.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.transport.close().await;
        self.cache.clear();
        debug!("Disconnected from OVSDB");
    }
}

impl Drop for OvsdbClient {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

async fn listen(cache: Arc<TableCache>, mut updates: UpdateReceiver) {
    while let Some(batch) = updates.recv().await {
        cache.apply(batch);
    }
    debug!("OVSDB update stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{BRIDGE_TABLE, ROOT_TABLE};
    use crate::types::{RowUpdate, TableUpdates};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use tokio_test::{assert_err, assert_ok};
    use tokio::sync::mpsc;

    /// Replays canned transact replies in order.
    struct Scripted {
        snapshot: TableUpdates,
        replies: Mutex<VecDeque<Vec<OperationResult>>>,
        submitted: Mutex<Vec<Vec<Operation>>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn transact(
            &self,
            _db: &str,
            ops: &[Operation],
        ) -> OvsdbResult<Vec<OperationResult>> {
            self.submitted.lock().push(ops.to_vec());
            self.replies
                .lock()
                .pop_front()
                .ok_or(OvsdbError::Disconnected)
        }

        async fn monitor(&self, _db: &str, _tables: &[&str]) -> OvsdbResult<TableUpdates> {
            Ok(self.snapshot.clone())
        }

        async fn close(&self) {}
    }

    fn root_snapshot() -> TableUpdates {
        let mut s = TableUpdates::new();
        s.push(
            ROOT_TABLE,
            Uuid::new_v4(),
            RowUpdate::insert(Row::new().with("ovs_version", "3.1.0")),
        );
        s
    }

    fn fast() -> ClientOptions {
        ClientOptions {
            root_wait_attempts: 3,
            root_wait_interval: Duration::from_millis(5),
            vsctl: Vsctl::default(),
        }
    }

    async fn client_with(
        replies: Vec<Vec<OperationResult>>,
    ) -> (OvsdbClient, Arc<Scripted>, mpsc::UnboundedSender<TableUpdates>) {
        let scripted = Arc::new(Scripted {
            snapshot: root_snapshot(),
            replies: Mutex::new(replies.into()),
            submitted: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let client = OvsdbClient::from_transport(scripted.clone(), rx, fast())
            .await
            .unwrap();
        (client, scripted, tx)
    }

    fn ok() -> OperationResult {
        OperationResult::default()
    }

    #[tokio::test]
    async fn test_short_reply_is_mismatch_for_any_size() {
        for n in 1..=4usize {
            let (client, _, _tx) = client_with(vec![vec![ok(); n - 1]]).await;
            let mut txn = Transaction::new();
            for _ in 0..n {
                txn.push(Operation::select(BRIDGE_TABLE, vec![]));
            }
            match client.transact(&txn).await {
                Err(OvsdbError::ReplyMismatch { expected, actual }) => {
                    assert_eq!((expected, actual), (n, n - 1));
                }
                other => panic!("n={}: expected ReplyMismatch, got {:?}", n, other),
            }
        }
    }

    #[tokio::test]
    async fn test_all_operation_errors_are_aggregated() {
        let reply = vec![
            OperationResult::with_error("constraint violation", "duplicate name"),
            ok(),
            OperationResult::with_error("referential integrity violation", "dangling ref"),
            // commit error element past the last operation
            OperationResult::with_error("aborted", ""),
        ];
        let (client, _, _tx) = client_with(vec![reply]).await;
        let txn = Transaction::new()
            .with(Operation::select(BRIDGE_TABLE, vec![]))
            .with(Operation::select(BRIDGE_TABLE, vec![]))
            .with(Operation::select(BRIDGE_TABLE, vec![]));

        let err = client.transact(&txn).await.unwrap_err();
        assert_eq!(
            err.transaction_errors(),
            &[
                "constraint violation(duplicate name)".to_string(),
                "referential integrity violation(dangling ref)".to_string(),
                "aborted()".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_transaction_is_not_sent() {
        let (client, scripted, _tx) = client_with(vec![]).await;
        assert_eq!(client.transact(&Transaction::new()).await.unwrap(), vec![]);
        assert!(scripted.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_exists_and_select_uuids() {
        let uuid = Uuid::new_v4();
        let found = OperationResult {
            rows: Some(vec![Row::new().with("_uuid", uuid)]),
            ..Default::default()
        };
        let none = OperationResult {
            rows: Some(vec![]),
            ..Default::default()
        };
        let (client, scripted, _tx) =
            client_with(vec![vec![found.clone()], vec![none], vec![found]]).await;

        assert!(client.exists(BRIDGE_TABLE, "ovs0").await.unwrap());
        assert!(!client.exists(BRIDGE_TABLE, "ovs1").await.unwrap());
        assert_eq!(
            client.select_uuids(BRIDGE_TABLE, "ovs0").await.unwrap(),
            vec![uuid]
        );

        let submitted = scripted.submitted.lock();
        assert_eq!(submitted.len(), 3);
        assert!(matches!(
            &submitted[2][0],
            Operation::Select { columns: Some(c), .. } if c == &vec!["_uuid".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_listener_applies_notifications() {
        let (client, _, tx) = client_with(vec![]).await;
        let bridge = Uuid::new_v4();
        let mut batch = TableUpdates::new();
        batch.push(
            BRIDGE_TABLE,
            bridge,
            RowUpdate::insert(Row::new().with("name", "ovs0")),
        );
        tx.send(batch).unwrap();

        for _ in 0..50 {
            if client.cache().row_count(BRIDGE_TABLE) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(
            client.cache().find_uuid_by_name(BRIDGE_TABLE, "ovs0"),
            Some(bridge)
        );
    }

    #[tokio::test]
    async fn test_missing_root_row_fails_construction() {
        let scripted = Arc::new(Scripted {
            snapshot: TableUpdates::new(),
            replies: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
        });
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = OvsdbClient::from_transport(scripted, rx, fast()).await;
        assert!(matches!(
            result,
            Err(OvsdbError::RootNotFound { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_clears_cache() {
        let (client, _, _tx) = client_with(vec![]).await;
        assert_ok!(client.root_uuid());
        client.disconnect().await;
        assert_err!(client.root_uuid());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_bounded_attempts() {
        let config = OvsdbConfig {
            endpoint: "unix:/nonexistent/ovsbridged-test/db.sock".to_string(),
            connect_attempts: 2,
            connect_retry_ms: 1,
            ..Default::default()
        };
        match OvsdbClient::connect(&config).await {
            Err(OvsdbError::Connection { attempts, .. }) => assert_eq!(attempts, 2),
            Err(other) => panic!("expected Connection error, got {:?}", other),
            Ok(_) => panic!("connect to a missing socket succeeded"),
        }
    }

    #[test]
    fn test_config_defaults_and_tcp() {
        let c = OvsdbConfig::default();
        assert_eq!(c.connect_attempts, 3);
        assert_eq!(
            c.endpoint().unwrap(),
            Endpoint::Unix("/var/run/openvswitch/db.sock".into())
        );
        assert_eq!(OvsdbConfig::tcp("10.0.0.2", 6640).endpoint, "tcp:10.0.0.2:6640");
    }
}
