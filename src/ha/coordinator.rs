//! Mastership Coordinator
//!
//! Handles:
//! - Heartbeat publication (with bounded retry)
//! - Polling peers, the master claim and, on hot proxies, the latest snapshot
//! - Promotion via a conditional write of the master claim
//! - Demotion when a higher fencing token appears
//! - Runtime mode changes requested by an admin surface

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::fencing::FencingGuard;
use super::records::{HeartbeatRecord, ManagementNode, MasterClaimRecord, ObservedClaim};
use super::state::{
    is_hot_proxy, is_standby, HighAvailabilityMode, ManagementNodeState, NodeStateMachine,
};
use crate::config::HaConfig;
use crate::controller::EntityController;
use crate::error::{FleetError, Result};
use crate::memento::FleetSnapshot;
use crate::persistence::{keys, put_overwrite, ObjectStore, SnapshotManifest, SnapshotPersister};
use crate::rebind::{GraphMode, LiveGraph, RebindEngine, RebindReport};

/// Why a promotion was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionTrigger {
    /// First decision at startup (AUTO or MASTER mode)
    Startup,
    /// The claimed master went silent
    StaleMaster,
    /// An admin asked for it; takes over even from a live master
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted { token: u64 },
    /// Another attempt on this node is still running
    AlreadyInProgress,
    /// A live master already holds the claim
    MasterAlive { owner: String, token: u64 },
}

/// Outcome of one entity resume issued after promotion
pub type ResumeResult = Result<String>;

/// Resets an in-flight flag when the attempt ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Coordinates mastership for one management node.
#[derive(Clone)]
pub struct HaManager {
    node_id: Arc<str>,
    config: Arc<HaConfig>,
    store: Arc<dyn ObjectStore>,
    persister: SnapshotPersister,
    engine: RebindEngine,
    controller: Arc<dyn EntityController>,
    clock: Arc<dyn Clock>,
    mode: Arc<RwLock<HighAvailabilityMode>>,
    machine: Arc<Mutex<NodeStateMachine>>,
    state_tx: Arc<watch::Sender<ManagementNodeState>>,
    fencing: Arc<FencingGuard>,
    /// Latest accepted claim; never replaced by one with a lower token
    known_claim: Arc<Mutex<Option<MasterClaimRecord>>>,
    peers: Arc<DashMap<String, HeartbeatRecord>>,
    last_heartbeat: Arc<Mutex<Option<DateTime<Utc>>>>,
    graph: Arc<RwLock<Option<Arc<LiveGraph>>>>,
    mirror_generation: Arc<AtomicU64>,
    heartbeat_in_flight: Arc<AtomicBool>,
    mirror_in_flight: Arc<AtomicBool>,
    promotion_in_flight: Arc<AtomicBool>,
    /// Started with HA disabled and never held a claim
    standalone: Arc<AtomicBool>,
    resume_cancel: Arc<Mutex<Option<CancellationToken>>>,
    resume_task: Arc<Mutex<Option<JoinHandle<Vec<ResumeResult>>>>>,
    coordination: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl HaManager {
    /// Create a coordinator; the HA timing configuration must be valid.
    pub fn new(
        node_id: impl Into<String>,
        config: HaConfig,
        store: Arc<dyn ObjectStore>,
        controller: Arc<dyn EntityController>,
    ) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ManagementNodeState::Initializing);
        Ok(Self {
            node_id: Arc::from(node_id.into()),
            mode: Arc::new(RwLock::new(config.mode)),
            config: Arc::new(config),
            persister: SnapshotPersister::new(store.clone()),
            store,
            engine: RebindEngine::default(),
            controller,
            clock: Arc::new(SystemClock),
            machine: Arc::new(Mutex::new(NodeStateMachine::new())),
            state_tx: Arc::new(state_tx),
            fencing: Arc::new(FencingGuard::new()),
            known_claim: Arc::new(Mutex::new(None)),
            peers: Arc::new(DashMap::new()),
            last_heartbeat: Arc::new(Mutex::new(None)),
            graph: Arc::new(RwLock::new(None)),
            mirror_generation: Arc::new(AtomicU64::new(0)),
            heartbeat_in_flight: Arc::new(AtomicBool::new(false)),
            mirror_in_flight: Arc::new(AtomicBool::new(false)),
            promotion_in_flight: Arc::new(AtomicBool::new(false)),
            standalone: Arc::new(AtomicBool::new(false)),
            resume_cancel: Arc::new(Mutex::new(None)),
            resume_task: Arc::new(Mutex::new(None)),
            coordination: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_engine(mut self, engine: RebindEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get_node_state(&self) -> ManagementNodeState {
        self.machine.lock().state()
    }

    pub fn mode(&self) -> HighAvailabilityMode {
        *self.mode.read()
    }

    pub fn state_changes(&self) -> watch::Receiver<ManagementNodeState> {
        self.state_tx.subscribe()
    }

    /// The current graph: authoritative on the master, a mirror on hot proxies
    pub fn live_graph(&self) -> Option<Arc<LiveGraph>> {
        self.graph.read().clone()
    }

    pub fn fencing_token(&self) -> Option<u64> {
        self.fencing.held()
    }

    pub fn highest_observed_token(&self) -> u64 {
        self.fencing.observed()
    }

    pub fn known_master(&self) -> Option<MasterClaimRecord> {
        self.known_claim.lock().clone()
    }

    pub fn peers(&self) -> Vec<HeartbeatRecord> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn node_record(&self) -> ManagementNode {
        ManagementNode {
            node_id: self.node_id.to_string(),
            state: self.get_node_state(),
            mode: self.mode(),
            last_heartbeat: *self.last_heartbeat.lock(),
            priority_token: self.fencing.observed(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Resolves the initial state and spawns the heartbeat and coordination
    /// loops. An explicit mode whose precondition fails leaves the node
    /// FAILED and returns the error.
    pub async fn start(&self) -> Result<ManagementNodeState> {
        let state = self.initialize().await?;
        if self.mode() != HighAvailabilityMode::Disabled {
            self.spawn_loops();
        }
        Ok(state)
    }

    /// Decides the first state from the configured mode.
    pub async fn initialize(&self) -> Result<ManagementNodeState> {
        let mode = self.mode();
        info!(node_id = %self.node_id, %mode, "Initializing management node");

        if mode == HighAvailabilityMode::Disabled {
            return self.become_standalone_master().await;
        }

        if let Err(e) = self.publish_heartbeat().await {
            return Err(self.fail(e));
        }
        let claim = match self.observe_cluster().await {
            Ok(claim) => claim,
            Err(e) => return Err(self.fail(e)),
        };
        let other_master = self.live_master(&claim).filter(|owner| owner != &*self.node_id);

        match mode {
            HighAvailabilityMode::Auto => {
                if other_master.is_some() {
                    self.set_state(ManagementNodeState::Standby)?;
                    return Ok(ManagementNodeState::Standby);
                }
                match self.promote(PromotionTrigger::Startup).await {
                    Ok(PromotionOutcome::Promoted { .. }) => {}
                    Ok(outcome) => {
                        debug!(?outcome, "Startup promotion did not win, joining as standby");
                        self.set_state(ManagementNodeState::Standby)?;
                    }
                    Err(FleetError::StaleClaimLost { winner, token }) => {
                        info!(%winner, token, "Lost startup race, joining as standby");
                        self.set_state(ManagementNodeState::Standby)?;
                    }
                    Err(e) if self.get_node_state() == ManagementNodeState::Failed => {
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(error = %e, "Startup promotion failed, joining as standby");
                        if self.get_node_state() == ManagementNodeState::Initializing {
                            self.set_state(ManagementNodeState::Standby)?;
                        }
                    }
                }
            }
            HighAvailabilityMode::Master => {
                if let Some(owner) = other_master {
                    return Err(self.fail(FleetError::ambiguous(format!(
                        "MASTER requested but node {} holds a live claim",
                        owner
                    ))));
                }
                match self.promote(PromotionTrigger::Startup).await {
                    Ok(PromotionOutcome::Promoted { .. }) => {}
                    Ok(outcome) => {
                        return Err(self.fail(FleetError::ambiguous(format!(
                            "MASTER requested but promotion did not succeed: {:?}",
                            outcome
                        ))));
                    }
                    Err(e) => {
                        return Err(self.fail(FleetError::ambiguous(format!(
                            "MASTER requested but promotion failed: {}",
                            e
                        ))));
                    }
                }
            }
            HighAvailabilityMode::Standby | HighAvailabilityMode::HotStandby => {
                if other_master.is_none() {
                    return Err(self.fail(FleetError::ambiguous(format!(
                        "{} requested but no live master exists",
                        mode
                    ))));
                }
                let target = if mode == HighAvailabilityMode::Standby {
                    ManagementNodeState::Standby
                } else {
                    ManagementNodeState::HotStandby
                };
                self.set_state(target)?;
            }
            HighAvailabilityMode::HotBackup => {
                self.set_state(ManagementNodeState::HotBackup)?;
            }
            HighAvailabilityMode::Disabled => unreachable!("handled above"),
        }

        let state = self.get_node_state();
        if is_hot_proxy(state) {
            if let Err(e) = self.refresh_mirror().await {
                warn!(error = %e, "Initial mirror load failed; will retry on next poll");
            }
        }
        self.publish_heartbeat_best_effort().await;
        Ok(state)
    }

    /// Stops both loops. A master gives up its claim; a failed node
    /// terminates.
    pub async fn shutdown(&self) -> Result<()> {
        self.coordination.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        match self.get_node_state() {
            ManagementNodeState::Master if !self.is_standalone() => {
                self.cancel_resumes();
                if let Err(e) = self.relinquish_claim().await {
                    warn!(error = %e, "Could not relinquish master claim on shutdown");
                }
                self.fencing.release();
            }
            ManagementNodeState::Failed => {
                self.set_state(ManagementNodeState::Terminated)?;
            }
            _ => {}
        }
        info!(node_id = %self.node_id, state = %self.get_node_state(), "Coordinator stopped");
        Ok(())
    }

    fn spawn_loops(&self) {
        let mut tasks = self.tasks.lock();

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(this.config.heartbeat_period());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.coordination.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = this.heartbeat_tick().await {
                            error!(node_id = %this.node_id, error = %e, "Heartbeat failed");
                        }
                        if this.is_stopped() {
                            break;
                        }
                    }
                }
            }
        }));

        let this = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(this.config.poll_period());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.coordination.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = this.poll_tick().await {
                            warn!(node_id = %this.node_id, error = %e, "Coordination poll failed");
                        }
                        if this.is_stopped() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    fn is_stopped(&self) -> bool {
        matches!(
            self.get_node_state(),
            ManagementNodeState::Failed | ManagementNodeState::Terminated
        )
    }

    // ------------------------------------------------------------------
    // Heartbeats
    // ------------------------------------------------------------------

    /// One heartbeat period. Returns false when the previous write was still
    /// in flight and this tick was skipped.
    pub async fn heartbeat_tick(&self) -> Result<bool> {
        if self.is_stopped() || self.mode() == HighAvailabilityMode::Disabled {
            return Ok(false);
        }
        let Some(_guard) = InFlight::enter(&self.heartbeat_in_flight) else {
            debug!(node_id = %self.node_id, "Heartbeat still in flight, skipping tick");
            return Ok(false);
        };

        if let Err(e) = self.publish_heartbeat().await {
            return Err(self.fail(e));
        }
        if self.get_node_state() == ManagementNodeState::Master {
            match self.renew_claim().await {
                Err(e @ FleetError::StoreUnavailable(_)) => {
                    self.demote(false);
                    return Err(e);
                }
                other => other?,
            }
        }
        Ok(true)
    }

    /// Writes this node's heartbeat, retrying store outages with backoff.
    async fn publish_heartbeat(&self) -> Result<()> {
        let now = self.clock.now();
        let record = HeartbeatRecord {
            node_id: self.node_id.to_string(),
            timestamp: now,
            state: self.get_node_state(),
            priority_token: self.fencing.observed(),
        };
        let bytes = serde_json::to_vec(&record)?;
        let key = keys::heartbeat(&self.node_id);
        let store = self.store.as_ref();
        let (key, bytes) = (key.as_str(), &bytes);
        self.config
            .publish_retry
            .run("heartbeat", || async move {
                put_overwrite(store, key, bytes.clone())
                    .await
                    .map_err(FleetError::from)
            })
            .await?;
        *self.last_heartbeat.lock() = Some(now);
        Ok(())
    }

    async fn publish_heartbeat_best_effort(&self) {
        if let Err(e) = self.publish_heartbeat().await {
            warn!(node_id = %self.node_id, error = %e, "Heartbeat after state change failed");
        }
    }

    /// Keeps the master's claim fresh, retrying store outages with backoff.
    async fn renew_claim(&self) -> Result<()> {
        self.config
            .publish_retry
            .run("claim renewal", move || self.renew_claim_once())
            .await
    }

    /// One read-modify-write of the claim. A version conflict means someone
    /// else wrote the slot, which is re-read and judged by token.
    async fn renew_claim_once(&self) -> Result<()> {
        let held = self.fencing.check()?;
        let observed = self.read_claim().await?;
        match &observed.claim {
            Some(claim) if claim.node_id == *self.node_id && claim.token == held => {
                let renewed = MasterClaimRecord::new(claim.node_id.clone(), held, self.clock.now());
                let written = self
                    .store
                    .put_if_version_matches(
                        keys::MASTER_CLAIM,
                        serde_json::to_vec(&renewed)?,
                        observed.version,
                    )
                    .await?;
                if written {
                    *self.known_claim.lock() = Some(renewed);
                } else {
                    let current = self.observe_claim().await?;
                    self.check_still_master(&current).await?;
                }
                Ok(())
            }
            _ => self.check_still_master(&observed).await,
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// One coordination period: read peers and the claim, then act on them.
    pub async fn poll_tick(&self) -> Result<()> {
        if self.is_stopped() || self.mode() == HighAvailabilityMode::Disabled {
            return Ok(());
        }
        let claim = self.observe_cluster().await?;
        let state = self.get_node_state();

        if state == ManagementNodeState::Master {
            return self.check_still_master(&claim).await;
        }

        if is_standby(state) && self.live_master(&claim).is_none() {
            info!(
                node_id = %self.node_id,
                stale_owner = ?claim.owner(),
                token = claim.token(),
                "Master claim is stale, attempting promotion"
            );
            match self.promote(PromotionTrigger::StaleMaster).await {
                Ok(outcome) => debug!(?outcome, "Promotion attempt finished"),
                Err(FleetError::StaleClaimLost { winner, token }) => {
                    info!(%winner, token, "Another node won the promotion race");
                }
                Err(e) => warn!(error = %e, "Promotion attempt failed"),
            }
            return Ok(());
        }

        if is_hot_proxy(state) {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.refresh_mirror().await {
                    warn!(node_id = %this.node_id, error = %e, "Mirror refresh failed");
                }
            });
        }
        Ok(())
    }

    /// Reads peer heartbeats and the claim, recording every token seen.
    async fn observe_cluster(&self) -> Result<ObservedClaim> {
        let keys_listed = self.store.list_by_prefix(keys::HEARTBEAT_PREFIX).await?;
        let mut seen = Vec::with_capacity(keys_listed.len());
        for key in keys_listed {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<HeartbeatRecord>(&raw.value) {
                Ok(record) if record.node_id != *self.node_id => {
                    self.fencing.observe(record.priority_token);
                    seen.push(record.node_id.clone());
                    self.peers.insert(record.node_id.clone(), record);
                }
                Ok(_) => {}
                Err(e) => warn!(%key, error = %e, "Ignoring unreadable heartbeat"),
            }
        }
        self.peers.retain(|id, _| seen.contains(id));
        self.observe_claim().await
    }

    async fn read_claim(&self) -> Result<ObservedClaim> {
        match self.store.get(keys::MASTER_CLAIM).await? {
            None => Ok(ObservedClaim {
                claim: None,
                version: None,
            }),
            Some(raw) => match serde_json::from_slice::<MasterClaimRecord>(&raw.value) {
                Ok(claim) => Ok(ObservedClaim {
                    claim: Some(claim),
                    version: Some(raw.version),
                }),
                Err(e) => {
                    warn!(error = %e, "Master claim unreadable, treating slot as empty");
                    Ok(ObservedClaim {
                        claim: None,
                        version: Some(raw.version),
                    })
                }
            },
        }
    }

    /// Reads the claim and accepts it only if its token is not below the
    /// highest token already observed.
    async fn observe_claim(&self) -> Result<ObservedClaim> {
        let observed = self.read_claim().await?;
        if let Some(claim) = &observed.claim {
            let highest = self.fencing.observed();
            if claim.token < highest {
                warn!(
                    token = claim.token,
                    highest, "Ignoring master claim older than a token already observed"
                );
            } else {
                self.fencing.observe(claim.token);
                *self.known_claim.lock() = Some(claim.clone());
            }
        }
        Ok(observed)
    }

    /// Owner of the claim if it is still live: not relinquished, carrying the
    /// highest token observed, and either freshly renewed or backed by a fresh
    /// MASTER heartbeat from its owner.
    fn live_master(&self, observed: &ObservedClaim) -> Option<String> {
        let claim = observed.claim.as_ref()?;
        if claim.timestamp == DateTime::<Utc>::UNIX_EPOCH || claim.token < self.fencing.observed() {
            return None;
        }
        let now = self.clock.now();
        let timeout = self.config.detection_timeout();
        if claim.is_fresh(now, timeout) {
            return Some(claim.node_id.clone());
        }
        if claim.node_id == *self.node_id {
            return None;
        }
        let heartbeat_alive = self.peers.get(&claim.node_id).is_some_and(|hb| {
            hb.state == ManagementNodeState::Master && hb.is_fresh(now, timeout)
        });
        heartbeat_alive.then(|| claim.node_id.clone())
    }

    // ------------------------------------------------------------------
    // Promotion / demotion
    // ------------------------------------------------------------------

    /// Attempts to become master. At most one attempt runs per node; a
    /// concurrent call returns `AlreadyInProgress` without doing anything.
    pub async fn promote(&self, trigger: PromotionTrigger) -> Result<PromotionOutcome> {
        let Some(_guard) = InFlight::enter(&self.promotion_in_flight) else {
            return Ok(PromotionOutcome::AlreadyInProgress);
        };

        let state = self.get_node_state();
        if !(is_standby(state) || state == ManagementNodeState::Initializing) {
            return Err(FleetError::IllegalTransition {
                from: state,
                to: ManagementNodeState::Master,
            });
        }

        // Always decide on a fresh read, never a cached claim
        let observed = self.observe_claim().await?;
        if trigger != PromotionTrigger::Manual {
            if let Some(owner) = self.live_master(&observed) {
                if owner != *self.node_id {
                    return Ok(PromotionOutcome::MasterAlive {
                        owner,
                        token: observed.token(),
                    });
                }
            }
        }

        let proposed = self.fencing.observed().max(observed.token()) + 1;
        let claim = MasterClaimRecord::new(self.node_id.to_string(), proposed, self.clock.now());
        let won = self
            .store
            .put_if_version_matches(
                keys::MASTER_CLAIM,
                serde_json::to_vec(&claim)?,
                observed.version,
            )
            .await?;

        if !won {
            let winner = self.observe_claim().await?;
            return Err(FleetError::StaleClaimLost {
                winner: winner.owner().unwrap_or_default().to_string(),
                token: winner.token(),
            });
        }

        self.fencing.acquire(proposed);
        *self.known_claim.lock() = Some(claim.clone());
        self.set_state(ManagementNodeState::Master)?;
        info!(node_id = %self.node_id, token = proposed, ?trigger, "Won master claim");
        self.publish_heartbeat_best_effort().await;

        let (graph, generation, report) = match self.load_graph(GraphMode::Authoritative).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(
                    node_id = %self.node_id,
                    error = %e,
                    "Rebind failed during promotion, giving up mastership"
                );
                if let Err(release_err) = self.relinquish_claim().await {
                    warn!(error = %release_err, "Could not relinquish claim after failed rebind");
                }
                self.fencing.release();
                self.set_state(ManagementNodeState::Standby)?;
                self.publish_heartbeat_best_effort().await;
                return Err(e);
            }
        };

        // A higher claim may have landed while the snapshot was loading
        let current = self.observe_claim().await?;
        if current.token() > proposed {
            warn!(
                token = proposed,
                newer = current.token(),
                "Newer claim appeared during promotion, abandoning"
            );
            self.demote(true);
            return Err(FleetError::StaleClaimLost {
                winner: current.owner().unwrap_or_default().to_string(),
                token: current.token(),
            });
        }

        for dangling in &report.dangling {
            debug!(reference = %dangling, "Promoted with dangling reference");
        }
        let graph = Arc::new(graph);
        *self.graph.write() = Some(graph.clone());
        self.mirror_generation.store(generation, Ordering::Release);
        self.resume_running(graph);
        Ok(PromotionOutcome::Promoted { token: proposed })
    }

    /// Checks a claim read while believing to be master.
    async fn check_still_master(&self, observed: &ObservedClaim) -> Result<()> {
        let Some(held) = self.fencing.held() else {
            return Ok(());
        };
        let superseded = match &observed.claim {
            Some(claim) => claim.token > held || (claim.token == held && claim.node_id != *self.node_id),
            None => false,
        };
        if superseded || self.fencing.observed() > held {
            warn!(
                node_id = %self.node_id,
                held,
                observed = self.fencing.observed(),
                owner = ?observed.owner(),
                "Higher fencing token observed, stepping down"
            );
            self.demote(true);
            self.publish_heartbeat_best_effort().await;
            return Err(FleetError::Fenced {
                held,
                observed: self.fencing.observed(),
            });
        }
        Ok(())
    }

    /// Stops acting as master immediately. Outstanding resumes are
    /// abandoned, and the node moves to STANDBY, or FAILED when it cannot
    /// reach the store consistently.
    fn demote(&self, store_reachable: bool) {
        self.fencing.release();
        self.cancel_resumes();
        *self.graph.write() = None;
        self.mirror_generation.store(0, Ordering::Release);
        if store_reachable {
            if let Err(e) = self.set_state(ManagementNodeState::Standby) {
                warn!(error = %e, "Demotion transition rejected");
            }
        } else {
            self.fail(FleetError::StoreUnavailable("demoted without store access".into()));
        }
    }

    /// Ages this node's claim so another node may take over at once.
    async fn relinquish_claim(&self) -> Result<()> {
        let observed = self.read_claim().await?;
        let Some(claim) = observed.claim.as_ref() else {
            return Ok(());
        };
        if claim.node_id != *self.node_id {
            return Ok(());
        }
        let released = claim.relinquished();
        self.store
            .put_if_version_matches(
                keys::MASTER_CLAIM,
                serde_json::to_vec(&released)?,
                observed.version,
            )
            .await?;
        info!(node_id = %self.node_id, token = claim.token, "Relinquished master claim");
        Ok(())
    }

    /// DISABLED mode: the node is master of its own fleet without any
    /// coordination.
    async fn become_standalone_master(&self) -> Result<ManagementNodeState> {
        let (graph, generation, _) = match self.load_graph(GraphMode::Authoritative).await {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.fail(e)),
        };
        self.set_state(ManagementNodeState::Master)?;
        self.standalone.store(true, Ordering::Release);
        let graph = Arc::new(graph);
        *self.graph.write() = Some(graph.clone());
        self.mirror_generation.store(generation, Ordering::Release);
        self.resume_running(graph);
        Ok(ManagementNodeState::Master)
    }

    fn is_standalone(&self) -> bool {
        self.standalone.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Loads the freshest snapshot and rebinds it off the async runtime.
    async fn load_graph(&self, mode: GraphMode) -> Result<(LiveGraph, u64, RebindReport)> {
        let (snapshot, load) = self.persister.load().await?;
        for problem in &load.problems {
            warn!(node_id = %self.node_id, error = %problem, "Snapshot member skipped");
        }
        let engine = self.engine.clone();
        let outcome = tokio::task::spawn_blocking(move || engine.rebind(snapshot, mode))
            .await
            .map_err(|e| FleetError::RebindFailed(format!("rebind worker panicked: {}", e)))??;
        Ok((outcome.graph, load.generation, outcome.report))
    }

    /// Rebuilds the read-only mirror when a newer snapshot generation exists.
    /// Returns true when a new graph was swapped in.
    pub async fn refresh_mirror(&self) -> Result<bool> {
        let Some(_guard) = InFlight::enter(&self.mirror_in_flight) else {
            return Ok(false);
        };
        let generation = self
            .persister
            .read_manifest()
            .await?
            .map(|m| m.generation)
            .unwrap_or(0);
        if self.graph.read().is_some()
            && generation == self.mirror_generation.load(Ordering::Acquire)
        {
            return Ok(false);
        }

        let (graph, loaded_generation, _) = self.load_graph(GraphMode::ReadOnly).await?;
        // The node may have changed role while the rebind ran
        if !is_hot_proxy(self.get_node_state()) {
            return Ok(false);
        }
        *self.graph.write() = Some(Arc::new(graph));
        self.mirror_generation
            .store(loaded_generation, Ordering::Release);
        debug!(node_id = %self.node_id, generation = loaded_generation, "Mirror refreshed");
        Ok(true)
    }

    /// Persists a new fleet snapshot. Only the current master may write, and
    /// only while its token is still the highest.
    pub async fn persist_snapshot(&self, snapshot: &FleetSnapshot) -> Result<SnapshotManifest> {
        let token = self.ensure_authoritative()?;
        if !self.is_standalone() {
            let current = self.observe_claim().await?;
            self.check_still_master(&current).await?;
        }
        let manifest = match self.persister.write(snapshot, &self.node_id, token).await {
            Ok(manifest) => manifest,
            Err(FleetError::StaleClaimLost { winner, token: newer }) if !self.is_standalone() => {
                warn!(
                    node_id = %self.node_id,
                    held = token,
                    newer,
                    %winner,
                    "Store refused snapshot from a superseded master, stepping down"
                );
                self.fencing.observe(newer);
                self.demote(true);
                self.publish_heartbeat_best_effort().await;
                return Err(FleetError::StaleClaimLost {
                    winner,
                    token: newer,
                });
            }
            Err(e) => return Err(e),
        };

        let engine = self.engine.clone();
        let snapshot = snapshot.clone();
        let outcome =
            tokio::task::spawn_blocking(move || engine.rebind(snapshot, GraphMode::Authoritative))
                .await
                .map_err(|e| FleetError::RebindFailed(e.to_string()))??;
        *self.graph.write() = Some(Arc::new(outcome.graph));
        self.mirror_generation
            .store(manifest.generation, Ordering::Release);
        Ok(manifest)
    }

    /// Starts an entity through the controller; refused once fenced.
    pub async fn start_entity(&self, entity_id: &str) -> Result<()> {
        self.ensure_authoritative()?;
        let entity = self
            .live_graph()
            .and_then(|g| g.entity(entity_id).cloned())
            .ok_or_else(|| FleetError::DanglingReference(format!("unknown entity {}", entity_id)))?;
        self.controller.resume(&entity).await
    }

    /// Stops an entity through the controller; refused once fenced.
    pub async fn stop_entity(&self, entity_id: &str) -> Result<()> {
        self.ensure_authoritative()?;
        self.controller.stop(entity_id).await
    }

    fn ensure_authoritative(&self) -> Result<u64> {
        let state = self.get_node_state();
        if self.is_standalone() && state == ManagementNodeState::Master {
            return Ok(0);
        }
        let token = self.fencing.check()?;
        if state != ManagementNodeState::Master {
            return Err(FleetError::Fenced {
                held: token,
                observed: self.fencing.observed(),
            });
        }
        Ok(token)
    }

    // ------------------------------------------------------------------
    // Entity resume
    // ------------------------------------------------------------------

    fn resume_running(&self, graph: Arc<LiveGraph>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.resume_cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let controller = self.controller.clone();
        let fencing = self.fencing.clone();
        let node_id = self.node_id.clone();

        let handle = tokio::spawn(async move {
            let mut set = JoinSet::new();
            for entity in graph.running_entities().cloned() {
                let controller = controller.clone();
                let fencing = fencing.clone();
                let cancel = cancel.clone();
                set.spawn(async move {
                    if let Err(e) = fencing.check() {
                        return Err(e);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(FleetError::ResumeAbandoned(entity.id.clone())),
                        result = controller.resume(&entity) => result.map(|_| entity.id.clone()),
                    }
                });
            }

            let mut results = Vec::with_capacity(set.len());
            while let Some(joined) = set.join_next().await {
                let result = joined
                    .unwrap_or_else(|e| Err(FleetError::internal(format!("resume task failed: {}", e))));
                match &result {
                    Ok(id) => debug!(node_id = %node_id, entity_id = %id, "Entity resumed"),
                    Err(e) => warn!(node_id = %node_id, error = %e, "Entity resume did not complete"),
                }
                results.push(result);
            }
            results
        });
        *self.resume_task.lock() = Some(handle);
    }

    fn cancel_resumes(&self) {
        if let Some(cancel) = self.resume_cancel.lock().take() {
            cancel.cancel();
        }
    }

    /// Waits for the resumes issued by the last promotion.
    pub async fn wait_for_resumes(&self) -> Vec<ResumeResult> {
        let handle = self.resume_task.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| vec![Err(FleetError::internal(e.to_string()))]),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Runtime control surface
    // ------------------------------------------------------------------

    /// Applies an admin-requested mode. Explicit modes whose preconditions do
    /// not hold move the node to FAILED rather than being reinterpreted.
    pub async fn request_mode_change(
        &self,
        requested: HighAvailabilityMode,
    ) -> Result<ManagementNodeState> {
        let state = self.get_node_state();
        let current_mode = self.mode();
        info!(node_id = %self.node_id, %current_mode, %requested, %state, "Mode change requested");

        if matches!(
            state,
            ManagementNodeState::Failed | ManagementNodeState::Terminated
        ) {
            return Err(FleetError::ambiguous(format!(
                "node is {}; a restart is required before changing mode",
                state
            )));
        }
        if current_mode == HighAvailabilityMode::Disabled {
            if requested == HighAvailabilityMode::Disabled {
                return Ok(state);
            }
            return Err(self.fail(FleetError::ambiguous(
                "a node running with HA disabled cannot rejoin coordination without a restart",
            )));
        }

        // A master leaving coordination gives up its claim first
        if requested == HighAvailabilityMode::Disabled {
            let state = if state == ManagementNodeState::Master {
                self.step_down(ManagementNodeState::Standby).await?
            } else {
                state
            };
            self.publish_heartbeat_best_effort().await;
            *self.mode.write() = requested;
            self.coordination.cancel();
            info!(node_id = %self.node_id, %state, "Left HA coordination");
            return Ok(state);
        }

        let claim = self.observe_cluster().await?;
        let other_master = self.live_master(&claim).filter(|owner| owner != &*self.node_id);

        let result = match requested {
            HighAvailabilityMode::Auto => {
                if state != ManagementNodeState::Master && other_master.is_none() {
                    self.move_to_standby_states(ManagementNodeState::Standby)?;
                    match self.promote(PromotionTrigger::StaleMaster).await {
                        Ok(_) | Err(FleetError::StaleClaimLost { .. }) => {}
                        Err(e) => warn!(error = %e, "Promotion under AUTO failed"),
                    }
                } else if state != ManagementNodeState::Master {
                    self.move_to_standby_states(ManagementNodeState::Standby)?;
                }
                Ok(self.get_node_state())
            }
            HighAvailabilityMode::Master => {
                if state == ManagementNodeState::Master {
                    Ok(state)
                } else if let Some(owner) = other_master {
                    Err(self.fail(FleetError::ambiguous(format!(
                        "MASTER requested but node {} holds a live claim",
                        owner
                    ))))
                } else if state == ManagementNodeState::HotBackup {
                    Err(FleetError::IllegalTransition {
                        from: state,
                        to: ManagementNodeState::Master,
                    })
                } else {
                    match self.promote(PromotionTrigger::StaleMaster).await {
                        Ok(PromotionOutcome::Promoted { .. }) => Ok(ManagementNodeState::Master),
                        Ok(outcome) => Err(self.fail(FleetError::ambiguous(format!(
                            "MASTER requested but promotion did not succeed: {:?}",
                            outcome
                        )))),
                        Err(e) => Err(self.fail(FleetError::ambiguous(format!(
                            "MASTER requested but promotion failed: {}",
                            e
                        )))),
                    }
                }
            }
            HighAvailabilityMode::Standby | HighAvailabilityMode::HotStandby => {
                let target = if requested == HighAvailabilityMode::Standby {
                    ManagementNodeState::Standby
                } else {
                    ManagementNodeState::HotStandby
                };
                if state == ManagementNodeState::Master {
                    self.step_down(target).await
                } else if other_master.is_none() {
                    Err(self.fail(FleetError::ambiguous(format!(
                        "{} requested but no live master exists",
                        requested
                    ))))
                } else {
                    self.move_to_standby_states(target).map(|_| target)
                }
            }
            HighAvailabilityMode::HotBackup => {
                if state == ManagementNodeState::Master {
                    self.step_down(ManagementNodeState::HotBackup).await
                } else {
                    self.move_to_standby_states(ManagementNodeState::HotBackup)
                        .map(|_| ManagementNodeState::HotBackup)
                }
            }
            HighAvailabilityMode::Disabled => unreachable!("handled above"),
        };

        if result.is_ok() {
            *self.mode.write() = requested;
            if is_hot_proxy(self.get_node_state()) {
                if let Err(e) = self.refresh_mirror().await {
                    warn!(error = %e, "Mirror load after mode change failed");
                }
            }
            self.publish_heartbeat_best_effort().await;
        }
        result
    }

    /// Promotes this node even if a master is alive; the old master steps
    /// down when it sees the higher token.
    pub async fn trigger_manual_promotion(&self) -> Result<PromotionOutcome> {
        let state = self.get_node_state();
        if !is_standby(state) {
            return Err(FleetError::IllegalTransition {
                from: state,
                to: ManagementNodeState::Master,
            });
        }
        self.observe_cluster().await?;
        self.promote(PromotionTrigger::Manual).await
    }

    async fn step_down(&self, target: ManagementNodeState) -> Result<ManagementNodeState> {
        self.cancel_resumes();
        if let Err(e) = self.relinquish_claim().await {
            warn!(error = %e, "Could not relinquish claim while stepping down");
        }
        self.fencing.release();
        *self.graph.write() = None;
        self.mirror_generation.store(0, Ordering::Release);
        self.set_state(target)?;
        Ok(target)
    }

    fn move_to_standby_states(&self, target: ManagementNodeState) -> Result<()> {
        self.set_state(target)?;
        if !is_hot_proxy(target) {
            *self.graph.write() = None;
            self.mirror_generation.store(0, Ordering::Release);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    fn set_state(&self, to: ManagementNodeState) -> Result<()> {
        let from = self.machine.lock().transition(to)?;
        if from != to {
            info!(node_id = %self.node_id, %from, %to, "Node state changed");
            self.state_tx.send_replace(to);
        }
        Ok(())
    }

    /// Moves to FAILED: the node can no longer prove its state, so it stops
    /// claiming authority. Returns the cause for propagation.
    fn fail(&self, cause: FleetError) -> FleetError {
        let from = self.machine.lock().fail();
        self.fencing.release();
        self.cancel_resumes();
        *self.graph.write() = None;
        self.coordination.cancel();
        if from != ManagementNodeState::Failed {
            error!(node_id = %self.node_id, %from, error = %cause, "Node failed");
            self.state_tx.send_replace(ManagementNodeState::Failed);
        }
        cause
    }
}
