use crate::admission::{ConnectionLimiter, FlowController};
use crate::config::Config;
use crate::delivery::{
    HistoryStore, IdGenerator, MemoryHistory, MemoryOfflineStore, NoticeKind, OfflineStore,
    RetryEngine, RetrySettings, WorkerPool,
};
use crate::groups::{GroupFanout, GroupShardService, MembershipCache, MemoryMembership};
use crate::net::cluster::{ClusterLink, ForwardedFrame, GroupBus, MemoryCluster};
use crate::net::dispatch::{DeliveryCtx, Dispatcher, HandlerRegistry};
use crate::net::ingress::{start_ingress, Ingress, IngressSettings};
use crate::net::redis_cluster::RedisCluster;
use crate::net::wire::GroupMsgPush;
use crate::ops::metrics::DeliveryMetrics;
use crate::presence::{ConnectionRegistry, PresenceTable};
use crate::store::{MemoryStore, RedisStore, SharedStore};
use crate::telemetry;
use crate::telemetry::LogHandle;
use crate::time::Clock;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// External systems the delivery core talks to. Swapped for shared instances when
/// several servers run in one process.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SharedStore>,
    pub offline: Arc<dyn OfflineStore>,
    pub history: Arc<dyn HistoryStore>,
    pub membership: Arc<dyn MembershipCache>,
    pub cluster: Arc<dyn ClusterLink>,
    pub group_bus: Arc<dyn GroupBus>,
}

impl Collaborators {
    /// Single-process collaborators backed by the in-memory implementations.
    pub fn in_memory<C: Clock>(clock: C) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        Self {
            store: Arc::new(MemoryStore::with_clock(clock)),
            offline: Arc::new(MemoryOfflineStore::new()),
            history: Arc::new(MemoryHistory::new()),
            membership: Arc::new(MemoryMembership::new()),
            cluster: cluster.clone(),
            group_bus: cluster,
        }
    }

    /// Shared store and cluster transport from `config.store`; in-memory when no Redis
    /// URL is configured. Offline, history and membership stay in-process.
    pub async fn from_config<C: Clock>(config: &Config, clock: C) -> Result<Self> {
        let Some(url) = config.store.redis_url.as_deref() else {
            tracing::info!("no redis url configured, running with in-process state");
            return Ok(Self::in_memory(clock));
        };
        let store = RedisStore::connect(url)
            .await
            .context("shared store unavailable")?;
        let cluster = Arc::new(
            RedisCluster::connect(url, &config.store.channel_prefix)
                .await
                .context("cluster transport unavailable")?,
        );
        Ok(Self {
            store: Arc::new(store),
            cluster: cluster.clone(),
            group_bus: cluster,
            ..Self::in_memory(clock)
        })
    }
}

/// Cheap, clonable view of the running services, handed to the ops endpoint.
#[derive(Clone)]
pub struct RuntimeHandle<C: Clock> {
    config: Arc<Config>,
    clock: C,
    server: String,
    store: Arc<dyn SharedStore>,
    limiter: ConnectionLimiter,
    flow: FlowController,
    shards: GroupShardService,
    fanout: GroupFanout,
    retry: RetryEngine<C>,
    dispatcher: Dispatcher<C>,
    ingress: Arc<Ingress<C>>,
    cluster: Arc<dyn ClusterLink>,
    group_bus: Arc<dyn GroupBus>,
    metrics: DeliveryMetrics,
    accepting: Arc<AtomicBool>,
}

impl<C: Clock> RuntimeHandle<C> {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> C {
        self.clock.clone()
    }

    /// Address this server publishes in presence records.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn store(&self) -> Arc<dyn SharedStore> {
        self.store.clone()
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn shards(&self) -> &GroupShardService {
        &self.shards
    }

    pub fn retry(&self) -> &RetryEngine<C> {
        &self.retry
    }

    pub fn dispatcher(&self) -> &Dispatcher<C> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.dispatcher.ctx().registry
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// Pools in the order they are drained at shutdown.
    pub fn pools(&self) -> [&WorkerPool; 3] {
        [
            self.ingress.sessions(),
            self.dispatcher.pool(),
            self.retry.pool(),
        ]
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Deliver a friend-request style notice produced outside this core.
    pub async fn notify_user(&self, user_id: &str, kind: NoticeKind, payload: Vec<u8>) {
        self.dispatcher
            .ctx()
            .deliver_notice(user_id, kind, payload)
            .await;
    }

    fn consume_cluster(
        &self,
        mut frames: mpsc::Receiver<ForwardedFrame>,
        mut groups: mpsc::Receiver<GroupMsgPush>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let fanout = self.fanout.clone();
        let server = self.server.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(frame) = frames.recv() => {
                        if let Err(err) = dispatcher.submit_forwarded(frame) {
                            tracing::warn!("forwarded frame on {server} shed: {err}");
                        }
                    }
                    Some(push) = groups.recv() => {
                        fanout.deliver(&push).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("cluster consumer on {server} stopped");
        })
    }
}

/// Wires the delivery core together and owns its background tasks.
pub struct Runtime<C: Clock> {
    handle: RuntimeHandle<C>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
    tasks: Vec<JoinHandle<()>>,
    ws_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
}

impl<C: Clock> Runtime<C> {
    /// Build a standalone server over in-memory collaborators. Must be called inside a
    /// tokio runtime; worker pools spawn their tasks here.
    pub fn new(config: Config, clock: C, log_handle: Option<LogHandle>) -> Result<Self> {
        let collaborators = Collaborators::in_memory(clock.clone());
        Self::with_collaborators(config, clock, log_handle, collaborators)
    }

    /// Build a server over the collaborators `config.store` selects.
    pub async fn connect(config: Config, clock: C, log_handle: Option<LogHandle>) -> Result<Self> {
        config.validate()?;
        let collaborators = Collaborators::from_config(&config, clock.clone()).await?;
        Self::with_collaborators(config, clock, log_handle, collaborators)
    }

    pub fn with_collaborators(
        config: Config,
        clock: C,
        log_handle: Option<LogHandle>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let Collaborators {
            store,
            offline,
            history,
            membership,
            cluster,
            group_bus,
        } = collaborators;
        let server = config.server.advertise_or_bind();
        let metrics = DeliveryMetrics::default();
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceTable::new(store.clone(), server.as_str());
        let ids = IdGenerator::new(clock.clone(), config.ids.datacenter_id, config.ids.machine_id)
            .context("invalid snowflake worker ids")?;

        let retry = RetryEngine::new(
            clock.clone(),
            store.clone(),
            registry.clone(),
            presence.clone(),
            offline.clone(),
            WorkerPool::new("resend", config.retry.workers, config.retry.queue),
            metrics.clone(),
            RetrySettings::from_config(&config.retry),
        );
        let shards = GroupShardService::new(
            store.clone(),
            membership,
            server.as_str(),
            Duration::from_secs(config.groups.shard_ttl_seconds),
            metrics.clone(),
        );
        let fanout = GroupFanout::new(shards.clone(), registry.clone(), metrics.clone());
        let svc = DeliveryCtx {
            clock: clock.clone(),
            ids: Arc::new(ids),
            registry,
            presence,
            retry: retry.clone(),
            offline,
            history,
            cluster: cluster.clone(),
            group_bus: group_bus.clone(),
            metrics: metrics.clone(),
            withdraw_window: Duration::from_secs(config.withdraw.window_seconds),
        };
        let dispatcher = Dispatcher::new(
            svc,
            Arc::new(HandlerRegistry::with_builtin()),
            WorkerPool::new(
                "dispatch",
                config.server.dispatch_workers,
                config.server.dispatch_queue,
            ),
        );
        let limiter = ConnectionLimiter::new(store.clone(), config.admission.connections.clone());
        let flow = FlowController::new(store.clone(), config.admission.flow.clone());
        let ingress = Arc::new(Ingress::new(
            clock.clone(),
            IngressSettings::from_config(&config.server),
            limiter.clone(),
            flow.clone(),
            shards.clone(),
            dispatcher.clone(),
            WorkerPool::new(
                "session",
                config.server.session_workers,
                config.server.session_queue,
            ),
        ));

        Ok(Self {
            handle: RuntimeHandle {
                config: Arc::new(config),
                clock,
                server,
                store,
                limiter,
                flow,
                shards,
                fanout,
                retry,
                dispatcher,
                ingress,
                cluster,
                group_bus,
                metrics,
                accepting: Arc::new(AtomicBool::new(false)),
            },
            shutdown_tx,
            shutdown_rx,
            log_handle,
            tasks: Vec::new(),
            ws_addr: None,
            http_addr: None,
        })
    }

    pub fn handle(&self) -> RuntimeHandle<C> {
        self.handle.clone()
    }

    /// Bound WebSocket address once started.
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }

    /// Start everything, then wait for ctrl-c or an internal shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested by component");
            }
        }
        self.drain().await
    }

    /// Bind listeners and spawn the cluster consumer and retry scanner.
    pub async fn start(&mut self) -> Result<()> {
        let handle = &self.handle;
        let config = handle.config.clone();
        let frames = handle
            .cluster
            .attach(&handle.server)
            .await
            .context("cluster link attach failed")?;
        let groups = handle
            .group_bus
            .subscribe(&handle.server)
            .await
            .context("group bus subscribe failed")?;
        self.tasks.push(handle.consume_cluster(
            frames,
            groups,
            self.shutdown_rx.clone(),
        ));

        if config.retry.enabled {
            let retry = handle.retry.clone();
            self.tasks
                .push(tokio::spawn(retry.run(self.shutdown_rx.clone())));
        } else {
            tracing::warn!("retry scanner disabled; unacknowledged messages will not be resent");
        }

        let (addr, accept) = start_ingress(
            &config.server.bind,
            handle.ingress.clone(),
            self.shutdown_rx.clone(),
        )
        .await?;
        self.ws_addr = Some(addr);
        self.tasks.push(accept);
        handle.accepting.store(true, Ordering::Release);

        if let Some(bind) = &config.telemetry.metrics_bind {
            let addr = telemetry::start_http(
                bind,
                self.handle.clone(),
                self.log_handle(),
                self.shutdown_rx.clone(),
            )
            .await?;
            self.http_addr = Some(addr);
        }
        tracing::info!("server {} started", self.handle.server);
        Ok(())
    }

    /// Ask a running [`Runtime::run`] to stop.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Start without waiting for a signal.
    pub async fn start_for_tests(&mut self) -> Result<()> {
        self.start().await
    }

    /// Stop background tasks and drain the pools without waiting for SIGINT.
    pub async fn shutdown_for_tests(&mut self) -> Result<()> {
        self.drain().await
    }

    async fn drain(&mut self) -> Result<()> {
        tracing::info!("draining server {}", self.handle.server);
        self.handle.accepting.store(false, Ordering::Release);
        self.shutdown_tx
            .send(true)
            .context("failed to broadcast shutdown")?;
        let server = &self.handle.server;
        if let Err(err) = self.handle.cluster.detach(server).await {
            tracing::warn!("cluster link detach failed: {err:#}");
        }
        if let Err(err) = self.handle.group_bus.unsubscribe(server).await {
            tracing::warn!("group bus unsubscribe failed: {err:#}");
        }
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!("background task ended abnormally: {err:?}");
            }
        }
        for pool in self.handle.pools() {
            pool.stop();
            pool.quiesce().await;
        }
        tracing::info!("server {} drained", self.handle.server);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn config(server: &str) -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".into();
        config.server.advertise = Some(server.into());
        config
    }

    #[tokio::test]
    async fn test_start_and_drain() {
        let clock = ManualClock::default();
        let cluster = Arc::new(MemoryCluster::new());
        let mut collaborators = Collaborators::in_memory(clock.clone());
        collaborators.cluster = cluster.clone();
        collaborators.group_bus = cluster.clone();
        let mut runtime =
            Runtime::with_collaborators(config("s1"), clock, None, collaborators).unwrap();
        runtime.start_for_tests().await.unwrap();
        let handle = runtime.handle();
        assert!(handle.accepting());
        assert!(runtime.ws_addr().is_some());
        assert_eq!(cluster.members(), vec!["s1".to_string()]);
        assert_eq!(cluster.subscribers(), vec!["s1".to_string()]);
        runtime.shutdown_for_tests().await.unwrap();
        assert!(!handle.accepting());
        assert!(cluster.members().is_empty());
        assert!(cluster.subscribers().is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_redis_runs_in_process() {
        let clock = ManualClock::default();
        let mut runtime = Runtime::connect(config("s1"), clock, None).await.unwrap();
        runtime.start_for_tests().await.unwrap();
        assert!(runtime.handle().accepting());
        runtime.shutdown_for_tests().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config("s1");
        config.retry.delays_seconds.clear();
        assert!(Runtime::new(config, ManualClock::default(), None).is_err());
    }

    #[tokio::test]
    async fn test_notice_for_offline_user_is_kept() {
        let clock = ManualClock::default();
        let offline = Arc::new(MemoryOfflineStore::new());
        let mut collaborators = Collaborators::in_memory(clock.clone());
        collaborators.offline = offline.clone();
        let runtime =
            Runtime::with_collaborators(config("s1"), clock, None, collaborators).unwrap();
        runtime
            .handle()
            .notify_user("bob", NoticeKind::FriendRequest, vec![1, 2])
            .await;
        assert_eq!(offline.notice_count("bob"), 1);
    }
}
