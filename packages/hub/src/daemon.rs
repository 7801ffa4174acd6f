//! Hub daemon.
//!
//! Single-instance coordinator process. Startup order matters: plan
//! first, then store hydration, then lease/hot-state repair, and only
//! then the loops that hand out work. Shutdown is graceful and bounded;
//! repeated `stop` calls share one outcome.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use mergeflow_arbiter::{
    Assignment, LeaseError, LeaseManager, SchedulePass, Scheduler, SchedulerSnapshot,
};
use mergeflow_bus::{
    channels, BusEvent, FileTransport, FileTransportConfig, MessageBus, RedisTransport,
    Transport,
};
use mergeflow_repo::{GitRepo, PlanFile};
use mergeflow_store::{KvClient, KvClientConfig, StateStore, StoreError};
use mergeflow_types::{
    AgentStatus, Clock, ColdState, CoordinationMode, Envelope, Payload, Plan, SystemClock,
};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::modes::ModeManager;
use crate::registry::AgentRegistry;
use crate::spawner::{AgentSpawner, SpawnerConfig};
use crate::status::HubStatus;
use crate::sync::StateSync;

const HUB_SENDER: &str = "hub";

/// Result of a shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// False when the agent-drain window expired and work was cut off.
    pub graceful: bool,
}

struct HubInner {
    config: HubConfig,
    clock: Arc<dyn Clock>,
    store: StateStore,
    repo: GitRepo,
    plan: Arc<RwLock<Plan>>,
    registry: Arc<AgentRegistry>,
    leases: LeaseManager,
    scheduler: Mutex<Scheduler>,
    bus: MessageBus,
    sync: Arc<StateSync>,
    modes: Arc<ModeManager>,
    spawner: AgentSpawner,
    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// pr_id -> leased paths for live assignments.
    active_leases: Mutex<HashMap<String, Vec<String>>>,
    /// Spawned agents that have not registered yet, with their deadline.
    pending_registrations: Mutex<Vec<(String, chrono::DateTime<chrono::Utc>)>>,
    stop_handle: Mutex<Option<Shared<BoxFuture<'static, ShutdownOutcome>>>>,
}

/// The coordinator daemon.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Start the hub: enforce single instance, load the plan, hydrate
    /// and repair the store, then begin scheduling.
    pub async fn start(config: HubConfig) -> Result<Hub, HubError> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        config: HubConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Hub, HubError> {
        tokio::fs::create_dir_all(&config.work_dir)
            .await
            .map_err(|e| HubError::io(config.work_dir.display().to_string(), e))?;
        tokio::fs::create_dir_all(config.message_dir())
            .await
            .map_err(|e| HubError::io(config.message_dir().display().to_string(), e))?;

        write_pid_file(&config.pid_path())?;
        match Self::start_inner(config.clone(), clock).await {
            Ok(hub) => Ok(hub),
            Err(err) => {
                let _ = std::fs::remove_file(config.pid_path());
                Err(err)
            }
        }
    }

    async fn start_inner(config: HubConfig, clock: Arc<dyn Clock>) -> Result<Hub, HubError> {
        // Plan before anything else: the repository is the source of
        // truth the rest of startup is reconciled against.
        let plan_file = PlanFile::new(config.plan_path());
        let plan = Arc::new(RwLock::new(plan_file.load().await?));

        let kv = KvClient::connect(KvClientConfig {
            url: config.store_url.clone(),
            probe_interval: config.probe_interval,
            ..KvClientConfig::default()
        })
        .await?;
        let store = StateStore::new(kv.clone());

        let repo = GitRepo::new(&config.repo_dir);
        let registry = Arc::new(AgentRegistry::new(clock.clone(), config.heartbeat_timeout));
        let leases = LeaseManager::new(store.clone(), config.pairings.clone());
        let bus = MessageBus::with_clock(config.bus.clone(), clock.clone());

        let redis_transport = {
            let transport = RedisTransport::new(kv.clone());
            Arc::new(match config.max_stream_len {
                Some(max) => transport.with_persistence(max),
                None => transport,
            })
        };
        let file_transport = Arc::new(FileTransport::new(FileTransportConfig::new(
            config.message_dir(),
        )));

        let sync = Arc::new(StateSync::new(
            store.clone(),
            repo.clone(),
            plan_file,
            config.plan_file.clone(),
            plan.clone(),
            bus.clone(),
            registry.clone(),
            clock.clone(),
            config.work_dir.join("isolated-state.json"),
        ));

        let modes = Arc::new(ModeManager::new(
            CoordinationMode::Distributed,
            config.failure_threshold,
            config.transition_cooldown,
            store.clone(),
            bus.clone(),
            repo.clone(),
            sync.clone(),
            redis_transport.clone(),
            file_transport,
            clock.clone(),
        ));

        let spawner = AgentSpawner::new(SpawnerConfig {
            program: config.agent_program.clone(),
            store_url: config.store_url.clone(),
            heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
            heartbeat_timeout_ms: config.heartbeat_timeout.as_millis() as u64,
            working_dir: Some(config.repo_dir.clone()),
        });

        let scheduler = Scheduler::new(config.scheduler.clone(), config.pairings.clone());

        let hub = Hub {
            inner: Arc::new(HubInner {
                config,
                clock,
                store,
                repo,
                plan,
                registry,
                leases,
                scheduler: Mutex::new(scheduler),
                bus,
                sync,
                modes,
                spawner,
                accepting: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                active_leases: Mutex::new(HashMap::new()),
                pending_registrations: Mutex::new(Vec::new()),
                stop_handle: Mutex::new(None),
            }),
        };

        hub.inner.sync.hydrate().await?;
        hub.repair_leases().await?;
        if let Err(err) = hub.inner.sync.reconcile().await {
            tracing::warn!(error = %err, "startup reconciliation incomplete");
        }

        let transport: Arc<dyn Transport> = redis_transport;
        hub.inner.bus.attach_transport(transport).await?;
        hub.spawn_loops();
        hub.inner.accepting.store(true, Ordering::Release);
        tracing::info!("hub started");
        Ok(hub)
    }

    /// Release every lease whose holder is not a live registered agent.
    /// A fresh hub has no live agents, so leftovers from a previous run
    /// are all swept.
    async fn repair_leases(&self) -> Result<(), StoreError> {
        let plan = self.inner.plan.read().await.clone();
        for item in &plan.items {
            let recorded = self.inner.store.item_leases(&item.id).await?;
            let mut kept = Vec::new();
            for path in recorded {
                match self.inner.store.load_lease(&path).await? {
                    Some(lease) if self.inner.registry.is_live(&lease.holder) => {
                        kept.push(path);
                    }
                    Some(_) => {
                        self.inner.store.purge_lease(&path).await?;
                    }
                    None => {}
                }
            }
            self.inner.store.set_item_leases(&item.id, &kept).await?;
        }
        Ok(())
    }

    fn spawn_loops(&self) {
        let mut tasks = self.inner.tasks.lock();

        tasks.push(self.inner.modes.spawn_loop(self.inner.config.probe_interval));
        tasks.push(
            self.inner
                .sync
                .spawn_display_loop(self.inner.config.display_sync_interval),
        );

        // Heartbeat monitor.
        let hub = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.inner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for crashed in hub.inner.registry.sweep() {
                    hub.reclaim_crashed(crashed).await;
                }
                hub.check_registration_grace().await;
            }
        }));

        // Scheduler loop.
        let hub = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.inner.config.scheduler_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if hub.inner.accepting.load(Ordering::Acquire) {
                    hub.run_scheduler_pass().await;
                }
            }
        }));

        // Inbound agent traffic.
        let hub = self.clone();
        let mut inbound = self.inner.bus.subscribe("agent-*");
        tasks.push(tokio::spawn(async move {
            while let Some((channel, envelope)) = inbound.recv().await {
                if envelope.from == HUB_SENDER {
                    continue;
                }
                if let Err(err) = hub.handle_message(&envelope).await {
                    tracing::warn!(channel = %channel, error = %err, "message handler failed");
                    hub.inner.bus.report_handler_error(&channel);
                }
            }
        }));

        // Status frames for dashboards.
        let hub = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.inner.config.display_sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let status = hub.status().await;
                let event = Envelope::new(
                    HUB_SENDER,
                    Payload::Custom {
                        name: "status".to_string(),
                        data: serde_json::to_value(&status).unwrap_or_default(),
                    },
                    hub.inner.clock.now(),
                );
                let _ = hub
                    .inner
                    .bus
                    .publish(&channels::system_channel("status"), event)
                    .await;
            }
        }));

        // Bus diagnostics become named system events so external
        // dashboards can observe them, not just in-process subscribers.
        let hub = self.clone();
        let mut bus_events = self.inner.bus.events();
        tasks.push(tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                let event = match bus_events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "bus diagnostic events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                hub.publish_bus_diagnostic(event).await;
            }
        }));
    }

    /// Republish one bus diagnostic on its `system:*` channel.
    /// Diagnostics about system-channel traffic stay internal, so a drop
    /// report cannot generate further drop reports.
    async fn publish_bus_diagnostic(&self, event: BusEvent) {
        let (name, origin, data) = match &event {
            BusEvent::MessageDropped { channel, id } => (
                "message-dropped",
                channel.clone(),
                serde_json::json!({ "channel": channel, "id": id }),
            ),
            BusEvent::MessageExpired { channel, id } => (
                "message-expired",
                channel.clone(),
                serde_json::json!({ "channel": channel, "id": id }),
            ),
            BusEvent::HandlerError { channel } => (
                "handler-error",
                channel.clone(),
                serde_json::json!({ "channel": channel }),
            ),
        };
        if origin.starts_with("system:") || origin.starts_with("system_") {
            return;
        }

        let envelope = Envelope::new(
            HUB_SENDER,
            Payload::Custom {
                name: name.to_string(),
                data,
            },
            self.inner.clock.now(),
        );
        if let Err(err) = self
            .inner
            .bus
            .publish(&channels::system_channel(name), envelope)
            .await
        {
            tracing::debug!(event = name, error = %err, "bus diagnostic not republished");
        }
    }

    pub fn mode(&self) -> CoordinationMode {
        self.inner.modes.current_mode()
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.inner.registry.clone()
    }

    pub async fn status(&self) -> HubStatus {
        let plan = self.inner.plan.read().await;
        HubStatus::collect(
            self.mode(),
            &self.inner.registry.list(),
            &plan,
            self.inner.scheduler.lock().passes(),
        )
    }

    /// Spawn `count` worker agents. Each is expected to register within
    /// the configured grace period.
    pub async fn spawn_agents(
        &self,
        agent_type: mergeflow_types::AgentType,
        tier: mergeflow_types::Tier,
        count: usize,
    ) -> Result<Vec<String>, HubError> {
        let grace = chrono::Duration::from_std(self.inner.config.registration_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let spawned = self.inner.spawner.spawn(agent_type, tier).await?;
            self.inner
                .pending_registrations
                .lock()
                .push((spawned.agent_id.clone(), self.inner.clock.now() + grace));
            ids.push(spawned.agent_id);
        }
        Ok(ids)
    }

    /// Flag spawned agents that never registered inside their grace
    /// period.
    async fn check_registration_grace(&self) {
        let now = self.inner.clock.now();
        let overdue: Vec<String> = {
            let mut pending = self.inner.pending_registrations.lock();
            pending.retain(|(id, _)| self.inner.registry.get(id).is_none());
            let (late, still_waiting): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(_, deadline)| now > *deadline);
            *pending = still_waiting;
            late.into_iter().map(|(id, _)| id).collect()
        };

        for agent_id in overdue {
            tracing::warn!(agent_id = %agent_id, "agent never registered within grace period");
            let event = Envelope::new(
                HUB_SENDER,
                Payload::Custom {
                    name: "registration-timeout".to_string(),
                    data: serde_json::json!({ "agent_id": agent_id }),
                },
                now,
            );
            let _ = self
                .inner
                .bus
                .publish(&channels::system_channel("registration-timeout"), event)
                .await;
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn run_scheduler_pass(&self) {
        let snapshot = {
            let plan = self.inner.plan.read().await;
            let held_paths = self
                .inner
                .active_leases
                .lock()
                .values()
                .flatten()
                .cloned()
                .collect();
            SchedulerSnapshot {
                items: plan.items.clone(),
                agents: self.inner.registry.list(),
                held_paths,
            }
        };

        let pass: SchedulePass = self.inner.scheduler.lock().plan_pass(&snapshot);

        if !pass.cycles.is_empty() {
            let event = Envelope::new(
                HUB_SENDER,
                Payload::Custom {
                    name: "conflict".to_string(),
                    data: serde_json::json!({ "cycles": pass.cycles }),
                },
                self.inner.clock.now(),
            );
            let _ = self
                .inner
                .bus
                .publish(&channels::system_channel("conflict"), event)
                .await;
        }

        for assignment in pass.assignments {
            if let Err(err) = self.dispatch_assignment(&assignment).await {
                // Contention is re-evaluated next pass; no retry here.
                tracing::debug!(
                    pr_id = %assignment.pr_id,
                    agent_id = %assignment.agent_id,
                    error = %err,
                    "assignment not dispatched"
                );
            }
        }
    }

    async fn dispatch_assignment(&self, assignment: &Assignment) -> Result<(), HubError> {
        let Assignment {
            agent_id,
            pr_id,
            claim_from,
            paths,
        } = assignment;

        self.inner
            .store
            .claim_work(pr_id, agent_id, *claim_from)
            .await?;

        let now = self.inner.clock.now();
        let leases = match self.inner.leases.acquire(agent_id, paths, now).await {
            Ok(leases) => leases,
            Err(err) => {
                if let Err(undo) = self.inner.store.release_work(pr_id, *claim_from).await {
                    tracing::warn!(pr_id = %pr_id, error = %undo, "claim rollback failed");
                }
                if let LeaseError::Taken { ref conflicts } = err {
                    tracing::debug!(pr_id = %pr_id, conflicts = ?conflicts, "lease contention");
                }
                return Err(err.into());
            }
        };

        let leased_paths: Vec<String> = leases.iter().map(|l| l.path.clone()).collect();
        self.inner
            .store
            .set_item_leases(pr_id, &leased_paths)
            .await?;
        let _ = self.inner.registry.mark_working(agent_id, pr_id);
        {
            let mut plan = self.inner.plan.write().await;
            if let Some(item) = plan.get_mut(pr_id) {
                let _ = item.transition(ColdState::InProgress);
            }
        }
        self.inner
            .active_leases
            .lock()
            .insert(pr_id.clone(), leased_paths.clone());

        let fencing: HashMap<String, u64> =
            leases.iter().map(|l| (l.path.clone(), l.token)).collect();
        let envelope = Envelope::new(
            HUB_SENDER,
            Payload::Assignment {
                pr_id: pr_id.clone(),
                fencing,
            },
            now,
        )
        .to(agent_id.clone());
        self.inner
            .bus
            .publish(&channels::agent_channel(agent_id), envelope)
            .await?;

        let lease_event = Envelope::new(
            HUB_SENDER,
            Payload::LeaseAcquired {
                holder: agent_id.clone(),
                paths: leased_paths,
            },
            now,
        );
        let _ = self
            .inner
            .bus
            .publish(&channels::coordination_channel("lease-acquired"), lease_event)
            .await;

        tracing::info!(pr_id = %pr_id, agent_id = %agent_id, "work assigned");
        Ok(())
    }

    // =========================================================================
    // Inbound messages
    // =========================================================================

    async fn handle_message(&self, envelope: &Envelope) -> Result<(), HubError> {
        match &envelope.payload {
            Payload::Registration {
                agent_type,
                tier,
                pid,
            } => {
                match self
                    .inner
                    .registry
                    .register(&envelope.from, *agent_type, *tier, *pid)
                {
                    Ok(_) => {
                        let _ = self
                            .inner
                            .store
                            .renew_heartbeat(&envelope.from, self.inner.clock.now())
                            .await;
                    }
                    Err(err) => {
                        // Protocol errors go back to the offender; the hub
                        // stays up.
                        let reply = Envelope::new(
                            HUB_SENDER,
                            Payload::Custom {
                                name: "registration-rejected".to_string(),
                                data: serde_json::json!({ "reason": err.to_string() }),
                            },
                            self.inner.clock.now(),
                        )
                        .to(envelope.from.clone());
                        let _ = self
                            .inner
                            .bus
                            .publish(&channels::agent_channel(&envelope.from), reply)
                            .await;
                    }
                }
                Ok(())
            }
            Payload::Heartbeat { status, current_pr } => {
                let _ = self
                    .inner
                    .registry
                    .heartbeat(&envelope.from, *status, current_pr.clone());
                let now = self.inner.clock.now();
                let _ = self.inner.store.renew_heartbeat(&envelope.from, now).await;

                // Heartbeats also keep the agent's leases warm.
                if let Some(pr_id) = current_pr {
                    let paths = self.inner.active_leases.lock().get(pr_id).cloned();
                    if let Some(paths) = paths {
                        if let Err(err) =
                            self.inner.leases.renew(&envelope.from, &paths, now).await
                        {
                            tracing::warn!(pr_id = %pr_id, error = %err, "lease renewal failed");
                        }
                    }
                }
                Ok(())
            }
            Payload::Progress {
                pr_id,
                hot_state,
                tokens,
                cost_usd,
                ..
            } => {
                self.inner
                    .store
                    .set_hot_state(pr_id, &envelope.from, *hot_state)
                    .await?;
                if tokens.is_some() || cost_usd.is_some() {
                    self.inner
                        .store
                        .record_usage(pr_id, tokens.unwrap_or(0), cost_usd.unwrap_or(0.0))
                        .await?;
                }
                if *hot_state == mergeflow_types::HotState::UnderReview {
                    self.transition_item(pr_id, &[ColdState::UnderReview]).await;
                }
                Ok(())
            }
            Payload::Complete {
                pr_id,
                actual_files,
            } => {
                self.finish_item(&envelope.from, pr_id, Some(actual_files.clone()), true)
                    .await
            }
            Payload::Failed { pr_id, reason } => {
                tracing::warn!(pr_id = %pr_id, agent_id = %envelope.from, %reason, "work item failed");
                self.finish_item(&envelope.from, pr_id, None, false).await
            }
            Payload::Custom { name, data } => {
                tracing::debug!(from = %envelope.from, %name, ?data, "custom message routed to default handler");
                Ok(())
            }
            other => {
                tracing::debug!(from = %envelope.from, kind = other.type_tag(), "ignoring message");
                Ok(())
            }
        }
    }

    /// Walk an item's cold state through each hop that is still pending.
    async fn transition_item(&self, pr_id: &str, hops: &[ColdState]) {
        for to in hops {
            if let Err(err) = self.inner.store.set_cold_state(pr_id, *to).await {
                tracing::warn!(pr_id = %pr_id, to = %to, error = %err, "cold transition rejected");
                return;
            }
            let mut plan = self.inner.plan.write().await;
            if let Some(item) = plan.get_mut(pr_id) {
                let _ = item.transition(*to);
            }
        }
    }

    /// Common tail of Complete and Failed: clear hot state, release
    /// leases, settle cold state, commit.
    async fn finish_item(
        &self,
        agent_id: &str,
        pr_id: &str,
        actual_files: Option<Vec<mergeflow_types::PlannedFile>>,
        completed: bool,
    ) -> Result<(), HubError> {
        self.inner.store.clear_hot_state(pr_id).await?;

        let paths = self
            .inner
            .active_leases
            .lock()
            .remove(pr_id)
            .unwrap_or_default();
        if !paths.is_empty() {
            if let Err(err) = self.inner.leases.release(agent_id, &paths).await {
                tracing::warn!(pr_id = %pr_id, error = %err, "lease release incomplete");
            }
            self.inner.store.set_item_leases(pr_id, &[]).await?;
        }

        if completed {
            if let Some(files) = actual_files {
                let mut plan = self.inner.plan.write().await;
                if let Some(item) = plan.get_mut(pr_id) {
                    item.actual_files = files;
                }
            }
            self.transition_item(pr_id, &[ColdState::UnderReview, ColdState::Completed])
                .await;
        } else {
            self.transition_item(pr_id, &[ColdState::Broken]).await;
        }

        let _ = self.inner.registry.mark_idle(agent_id);

        let now = self.inner.clock.now();
        let release_event = Envelope::new(
            HUB_SENDER,
            Payload::LeaseReleased {
                holder: agent_id.to_string(),
                paths,
            },
            now,
        );
        let _ = self
            .inner
            .bus
            .publish(&channels::coordination_channel("lease-released"), release_event)
            .await;

        let verb = if completed { "complete" } else { "broken" };
        if let Err(err) = self.inner.sync.cold_sync(&format!("{verb}: {pr_id}")).await {
            tracing::warn!(pr_id = %pr_id, error = %err, "cold sync failed");
        }
        Ok(())
    }

    // =========================================================================
    // Crash reclamation
    // =========================================================================

    async fn reclaim_crashed(&self, crashed: mergeflow_types::AgentInfo) {
        let agent_id = crashed.id.clone();

        if let Some(pr_id) = crashed.assigned_pr {
            let paths = {
                let mut active = self.inner.active_leases.lock();
                active.remove(&pr_id)
            }
            .unwrap_or_default();

            if let Err(err) = self.inner.leases.reclaim_holder(&agent_id, &paths).await {
                tracing::warn!(agent_id = %agent_id, error = %err, "lease reclamation incomplete");
            }
            let _ = self.inner.store.set_item_leases(&pr_id, &[]).await;

            // Partial changes in the expected paths mean the tree may be
            // inconsistent: the item is broken, not merely unassigned.
            let target = match self.inner.repo.has_partial_changes(&paths).await {
                Ok(true) => ColdState::Broken,
                Ok(false) => ColdState::Ready,
                Err(err) => {
                    tracing::warn!(error = %err, "partial-change probe failed, assuming broken");
                    ColdState::Broken
                }
            };
            if let Err(err) = self.inner.store.release_work(&pr_id, target).await {
                tracing::warn!(pr_id = %pr_id, error = %err, "work release failed");
            }
            let mut plan = self.inner.plan.write().await;
            if let Some(item) = plan.get_mut(&pr_id) {
                let _ = item.transition(target);
            }
            tracing::info!(pr_id = %pr_id, target = %target, "reclaimed work from crashed agent");
        }

        let _ = self.inner.store.evict_heartbeat(&agent_id).await;
        self.inner.registry.evict(&agent_id);

        let event = Envelope::new(
            HUB_SENDER,
            Payload::Custom {
                name: "agent-crashed".to_string(),
                data: serde_json::json!({ "agent_id": agent_id.clone() }),
            },
            self.inner.clock.now(),
        );
        let _ = self
            .inner
            .bus
            .publish(&channels::system_channel("agent-crashed"), event)
            .await;

        if let Err(err) = self
            .inner
            .sync
            .cold_sync(&format!("reclaim work from {agent_id}"))
            .await
        {
            tracing::warn!(error = %err, "cold sync after reclamation failed");
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Graceful shutdown. Repeated calls share the same outcome.
    pub fn stop(&self) -> Shared<BoxFuture<'static, ShutdownOutcome>> {
        let mut slot = self.inner.stop_handle.lock();
        if let Some(handle) = slot.as_ref() {
            return handle.clone();
        }
        let hub = self.clone();
        let handle = async move { hub.run_shutdown(false).await }.boxed().shared();
        *slot = Some(handle.clone());
        handle
    }

    /// Shutdown without waiting for agents to finish.
    pub fn stop_force(&self) -> Shared<BoxFuture<'static, ShutdownOutcome>> {
        let mut slot = self.inner.stop_handle.lock();
        if let Some(handle) = slot.as_ref() {
            return handle.clone();
        }
        let hub = self.clone();
        let handle = async move { hub.run_shutdown(true).await }.boxed().shared();
        *slot = Some(handle.clone());
        handle
    }

    async fn run_shutdown(self, force: bool) -> ShutdownOutcome {
        tracing::info!(force, "hub shutting down");
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.registry.mark_all_shutting_down();

        let now = self.inner.clock.now();
        let shutdown = Envelope::new(
            HUB_SENDER,
            Payload::Shutdown {
                reason: "hub stopping".to_string(),
            },
            now,
        );
        let _ = self
            .inner
            .bus
            .publish(channels::HUB_BROADCAST, shutdown)
            .await;

        let mut graceful = true;
        if !force {
            let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_timeout;
            loop {
                let busy = self
                    .inner
                    .registry
                    .list()
                    .iter()
                    .any(|a| a.status == AgentStatus::Working);
                if !busy {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!("agents still working at shutdown deadline");
                    graceful = false;
                    break;
                }
                tokio::time::sleep(self.inner.config.shutdown_poll).await;
            }
        }

        if let Err(err) = self.inner.sync.cold_sync("hub shutdown").await {
            tracing::warn!(error = %err, "final cold sync failed");
        }

        let active: Vec<(String, Vec<String>)> = self
            .inner
            .active_leases
            .lock()
            .drain()
            .collect();
        for (pr_id, paths) in active {
            for path in &paths {
                let _ = self.inner.store.purge_lease(path).await;
            }
            let _ = self.inner.store.set_item_leases(&pr_id, &[]).await;
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        if let Err(err) = std::fs::remove_file(self.inner.config.pid_path()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, "pid file removal failed");
            }
        }

        tracing::info!(graceful, "hub stopped");
        ShutdownOutcome { graceful }
    }
}

/// Write the PID file, failing if another live hub owns it.
fn write_pid_file(path: &Path) -> Result<(), HubError> {
    if let Ok(raw) = std::fs::read_to_string(path) {
        if let Ok(pid) = raw.trim().parse::<u32>() {
            if pid_alive(pid) {
                return Err(HubError::AlreadyRunning { pid });
            }
            tracing::info!(stale_pid = pid, "removing stale pid file");
        }
    }

    std::fs::write(path, std::process::id().to_string())
        .map_err(|e| HubError::io(path.display().to_string(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(err) = std::fs::set_permissions(path, perms) {
            tracing::warn!(error = %err, "pid file permissions not restricted");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_detects_live_collision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".hub.pid");

        // Our own pid is certainly alive.
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        let err = write_pid_file(&path).unwrap_err();
        assert!(matches!(err, HubError::AlreadyRunning { .. }));
    }

    #[test]
    fn test_pid_file_replaces_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".hub.pid");

        // Pid u32::MAX is not a real process.
        std::fs::write(&path, u32::MAX.to_string()).unwrap();
        write_pid_file(&path).unwrap();

        let written: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".hub.pid");

        write_pid_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_garbage_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".hub.pid");

        std::fs::write(&path, "not-a-pid").unwrap();
        write_pid_file(&path).unwrap();
    }
}
