//! Host Context
//!
//! Everything one host serves: the rank registry and coordinator, the
//! subsystem managers and the device locks they share. Built once at startup
//! and passed explicitly to the API layer and the cluster services.

use crate::cluster::{ClusterEvent, EventSink, HostEndpoint, HostRequest, HostResponse};
use crate::config::ControlConfig;
use crate::domain::{
    EngineState, FabricScannerRef, FailureKind, Rank, StorageProviderRef,
};
use crate::engine::{ExitNotice, MockEngine, ProcessEngine, RankEvent, RankRegistry};
use crate::error::Result;
use crate::fanout::{Dispatcher, KeyedLocks, RankCoordinator};
use crate::hardware::{
    StaticFabricScanner, StaticStorageProvider, SysfsFabricScanner, SysfsStorageProvider,
};
use crate::metrics;
use crate::subsystem::smd::SmdTable;
use crate::subsystem::{FirmwareManager, NetworkManager, SmdManager, StorageManager};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct HostContext {
    host_id: String,
    registry: Arc<RankRegistry>,
    coordinator: RankCoordinator,
    storage: StorageManager,
    firmware: FirmwareManager,
    network: NetworkManager,
    smd: SmdManager,
    /// Shared by storage and firmware operations, keyed by PCI address
    device_locks: Arc<KeyedLocks<String>>,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("host_id", &self.host_id)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl HostContext {
    pub fn new(
        host_id: impl Into<String>,
        coordinator: RankCoordinator,
        storage_provider: StorageProviderRef,
        fabric_scanner: FabricScannerRef,
        device_deadline: Duration,
    ) -> Self {
        let registry = coordinator.registry().clone();
        let device_locks = Arc::new(KeyedLocks::new());
        let smd_table = Arc::new(SmdTable::new());

        let storage = StorageManager::new(
            storage_provider.clone(),
            registry.clone(),
            smd_table.clone(),
            Dispatcher::new("storage", device_locks.clone(), FailureKind::DeviceFailure),
            device_deadline,
        );
        let firmware = FirmwareManager::new(
            storage_provider,
            Dispatcher::new("firmware", device_locks.clone(), FailureKind::DeviceFailure),
            device_deadline,
        );

        Self {
            host_id: host_id.into(),
            registry,
            coordinator,
            storage,
            firmware,
            network: NetworkManager::new(fabric_scanner),
            smd: SmdManager::new(smd_table, device_deadline),
            device_locks,
        }
    }

    /// Build from configuration: real engines and hardware, or simulated ones.
    ///
    /// Must run inside a Tokio runtime; engine exit notices are consumed by
    /// a spawned task.
    pub fn from_config(config: &ControlConfig) -> Result<Arc<Self>> {
        let registry = RankRegistry::new();
        let coordinator = RankCoordinator::new(registry.clone(), config.timeouts.coordinator());
        let deadline = config.timeouts.fanout();

        if config.simulation.enabled {
            let sim = &config.simulation;
            for rank in sim.first_rank..sim.first_rank + sim.ranks {
                coordinator.add_engine(Arc::new(MockEngine::new(rank)))?;
            }
            info!(ranks = sim.ranks, controllers = sim.controllers, "Simulation mode");
            let context = Self::new(
                config.host_id.clone(),
                coordinator,
                Arc::new(StaticStorageProvider::with_sample_controllers(sim.controllers)),
                Arc::new(StaticFabricScanner::sample()),
                deadline,
            );
            return Ok(Arc::new(context));
        }

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        for spec in &config.engines {
            let engine = ProcessEngine::new(spec.clone()).with_exit_notices(exit_tx.clone());
            coordinator.add_engine(Arc::new(engine))?;
        }

        let context = Arc::new(Self::new(
            config.host_id.clone(),
            coordinator,
            Arc::new(SysfsStorageProvider::new(config.hardware.scanner())),
            Arc::new(SysfsFabricScanner::new(config.hardware.sysfs_path.clone())),
            deadline,
        ));
        context.spawn_exit_watcher(exit_rx);
        Ok(context)
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn registry(&self) -> &Arc<RankRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &RankCoordinator {
        &self.coordinator
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn firmware(&self) -> &FirmwareManager {
        &self.firmware
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    pub fn smd(&self) -> &SmdManager {
        &self.smd
    }

    pub fn device_locks(&self) -> &Arc<KeyedLocks<String>> {
        &self.device_locks
    }

    /// Ranks currently in the given state
    pub fn ranks_in(&self, state: EngineState) -> Vec<Rank> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|e| e.state == state)
            .map(|e| e.rank)
            .collect()
    }

    /// Record unrequested engine exits in the registry
    pub fn spawn_exit_watcher(
        &self,
        mut notices: mpsc::UnboundedReceiver<ExitNotice>,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                match registry.notify_exit(notice.rank, notice.clean) {
                    Ok(state) => debug!(rank = %notice.rank, clean = notice.clean, %state, "Engine exit recorded"),
                    Err(e) => warn!(rank = %notice.rank, error = %e, "Exit notice for unknown rank"),
                }
            }
        })
    }

    /// Follow registry events: keep the ready gauge current and report
    /// engines that died on their own to `sink`.
    pub fn spawn_event_loop(&self, sink: Option<Arc<dyn EventSink>>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let host = self.host_id.clone();
        let mut events = registry.subscribe();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Rank event loop lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                metrics::RANKS_READY.set(registry.stats().ready_ranks as i64);

                let RankEvent::EngineExited { rank, clean: false } = event else {
                    continue;
                };
                if registry.state(rank).ok() != Some(EngineState::Errored) {
                    continue;
                }
                if let Some(sink) = &sink {
                    let died = ClusterEvent::EngineDied {
                        rank,
                        host: host.clone(),
                        reason: "engine exited unexpectedly".to_string(),
                    };
                    if let Err(e) = sink.send(died).await {
                        warn!(%rank, error = %e, "Failed to report engine death");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl HostEndpoint for HostContext {
    async fn handle(&self, request: HostRequest) -> Result<HostResponse> {
        match request {
            HostRequest::Ranks(request) => {
                self.coordinator.fanout(request).await.map(HostResponse::Ranks)
            }
            HostRequest::StorageScan(request) => {
                self.storage.scan(&request).await.map(HostResponse::StorageScan)
            }
            HostRequest::NetworkScan(request) => {
                self.network.scan(&request).await.map(HostResponse::NetworkScan)
            }
            HostRequest::SmdQuery(request) => Ok(HostResponse::SmdQuery(self.smd.query(&request))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FanoutRequest, RankOp};
    use crate::subsystem::StorageScanRequest;
    use parking_lot::Mutex;

    fn simulated() -> Arc<HostContext> {
        let mut config = ControlConfig::default();
        config.simulation.enabled = true;
        config.simulation.ranks = 3;
        HostContext::from_config(&config).unwrap()
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ClusterEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, event: ClusterEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_simulated_host_serves_requests() {
        let context = simulated();
        assert_eq!(context.ranks_in(EngineState::Unknown).len(), 3);

        let response = context
            .handle(HostRequest::Ranks(FanoutRequest::all(RankOp::Start)))
            .await
            .unwrap();
        let HostResponse::Ranks(result) = response else {
            panic!("expected rank results");
        };
        assert!(result.all_succeeded());
        assert_eq!(context.ranks_in(EngineState::Ready).len(), 3);

        let scan = context
            .handle(HostRequest::StorageScan(StorageScanRequest::default()))
            .await
            .unwrap();
        assert!(matches!(scan, HostResponse::StorageScan(s) if s.controllers.len() == 2));
    }

    #[tokio::test]
    async fn test_unclean_exit_reaches_sink() {
        let context = simulated();
        let sink = Arc::new(RecordingSink::default());
        let event_loop = context.spawn_event_loop(Some(sink.clone()));

        context
            .coordinator()
            .fanout(FanoutRequest::all(RankOp::Start))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = context.spawn_exit_watcher(rx);
        tx.send(ExitNotice {
            rank: Rank(1),
            clean: false,
        })
        .unwrap();
        drop(tx);
        watcher.await.unwrap();

        for _ in 0..50 {
            if !sink.events.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            sink.events.lock().as_slice(),
            &[ClusterEvent::EngineDied {
                rank: Rank(1),
                host: "127.0.0.1:8090".into(),
                reason: "engine exited unexpectedly".into(),
            }]
        );
        assert_eq!(context.registry().state(Rank(1)).unwrap(), EngineState::Errored);
        event_loop.abort();
    }
}
