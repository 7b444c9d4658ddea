//! Step pipeline for bringing up a bridge
//!
//! A [`BridgeSetup`] is a plan of [`SetupStep`]s applied strictly in order.
//! The first failing step aborts the plan and its error is returned as is;
//! steps that need compensation do it themselves (see
//! [`CommandManager`](crate::commands::CommandManager)).

use std::time::Duration;

use async_trait::async_trait;
use ovs_cfgmgr_common::HostNetwork;
use ovs_ovsdb::OvsdbClient;
use tracing::{debug, info, warn};

use crate::commands::STALE_ROUTE_RETRY_INTERVAL;
use crate::config::NetworkConfig;
use crate::error::Result;

/// Everything a step may touch.
#[derive(Clone, Copy)]
pub struct SetupContext<'a> {
    pub ovsdb: &'a OvsdbClient,
    pub host: &'a dyn HostNetwork,
    pub network: &'a NetworkConfig,
    /// Passed on to the host commands run by NIC attachment
    pub stale_route_retry_interval: Duration,
}

impl<'a> SetupContext<'a> {
    pub fn new(ovsdb: &'a OvsdbClient, host: &'a dyn HostNetwork, network: &'a NetworkConfig) -> Self {
        Self {
            ovsdb,
            host,
            network,
            stale_route_retry_interval: STALE_ROUTE_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.stale_route_retry_interval = interval;
        self
    }

    pub fn bridge_name(&self) -> &str {
        &self.network.bridge_name
    }
}

/// One stage of bridge bring-up.
#[async_trait]
pub trait SetupStep: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn apply(&self, ctx: &SetupContext<'_>) -> Result<()>;
}

/// Ordered, abort-on-first-error plan of setup steps.
#[derive(Default)]
pub struct BridgeSetup {
    steps: Vec<Box<dyn SetupStep>>,
}

impl BridgeSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_step(&mut self, step: impl SetupStep + 'static) {
        self.steps.push(Box::new(step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Runs every queued step in order, stopping at the first failure.
    pub async fn apply(&self, ctx: &SetupContext<'_>) -> Result<()> {
        let bridge = ctx.bridge_name();
        for step in &self.steps {
            debug!(bridge = %bridge, step = step.name(), "Applying setup step");
            if let Err(e) = step.apply(ctx).await {
                warn!(bridge = %bridge, step = step.name(), error = %e, "Setup step failed");
                return Err(e);
            }
        }
        info!(bridge = %bridge, steps = self.steps.len(), "Bridge setup complete");
        Ok(())
    }
}
