//! Deterministic simulation runner.
//!
//! Each node has its own storage and application. When a node emits
//! `Action::CommitProposal`, the runner calls that node's application
//! inline (synchronously) for deterministic execution.

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::{NodeIndex, RecordingApplication};
use pbft_bft::persistence::{load_recovered_state, persist_checkpoint, persist_snapshot};
use pbft_bft::{BftConfig, BftState, ConfigError, RecoveredState};
use pbft_core::{Action, Application, Event, MemoryDb, StateMachine, StaticBackend, TimerId};
use pbft_messages::{Message, MessageCode};
use pbft_types::{Request, ValidatorId, View};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    /// All nodes in the simulation, indexed by NodeIndex. `None` while crashed.
    nodes: Vec<Option<BftState>>,

    /// Per-node identity and signing.
    backends: Vec<Arc<StaticBackend>>,

    /// Per-node storage. Survives crashes.
    storage: Vec<Arc<MemoryDb>>,

    /// Per-node application. Survives crashes.
    applications: Vec<Arc<RecordingApplication>>,

    /// Every message each node broadcast, in order.
    sent: Vec<Vec<Message>>,

    bft_config: BftConfig,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    /// Network simulator.
    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Armed timers. Setting a timer replaces the previous one.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    /// Statistics.
    stats: SimulationStats,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Events discarded because the target node was down.
    pub events_dropped_crashed: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Commits handed to applications.
    pub proposals_committed: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

impl SimulationRunner {
    /// Create a new simulation runner.
    ///
    /// Validator `i` runs on node `i`. Nodes are idle until [`start`](Self::start).
    /// Fails if `bft_config` cannot build a validator set for the network size.
    pub fn new(
        network_config: NetworkConfig,
        bft_config: BftConfig,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        let network = SimulatedNetwork::new(network_config);
        let rng = ChaCha8Rng::seed_from_u64(seed);

        let ids: Vec<ValidatorId> = network
            .all_nodes()
            .into_iter()
            .map(|i| ValidatorId(i as u64))
            .collect();
        let validators = bft_config.validator_set(ids.clone())?;

        let backends: Vec<Arc<StaticBackend>> = ids
            .iter()
            .map(|&id| Arc::new(StaticBackend::insecure_for_testing(id, validators.clone())))
            .collect();
        let num_nodes = backends.len();
        let storage = (0..num_nodes).map(|_| Arc::new(MemoryDb::new())).collect();
        let applications = (0..num_nodes)
            .map(|_| Arc::new(RecordingApplication::new()))
            .collect();
        let nodes = backends
            .iter()
            .map(|backend| {
                Some(BftState::new(
                    bft_config.clone(),
                    backend.clone(),
                    RecoveredState::default(),
                ))
            })
            .collect();

        info!(
            num_nodes,
            quorum = validators.quorum(),
            seed,
            "Created simulation runner"
        );

        Ok(Self {
            nodes,
            backends,
            storage,
            applications,
            sent: vec![Vec::new(); num_nodes],
            bft_config,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network,
            rng,
            timers: HashMap::new(),
            stats: SimulationStats::default(),
        })
    }

    /// Start consensus on every node.
    pub fn start(&mut self) {
        for index in 0..self.nodes.len() as NodeIndex {
            self.start_node(index);
        }
    }

    fn start_node(&mut self, index: NodeIndex) {
        let now = self.now;
        let Some(node) = self.nodes[index as usize].as_mut() else {
            return;
        };
        node.set_time(now);
        let actions = node.start();
        for action in actions {
            self.process_action(index, action);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Get simulation statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Get current simulation time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Number of nodes, running or not.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Get a running node by index.
    pub fn node(&self, index: NodeIndex) -> Option<&BftState> {
        self.nodes.get(index as usize).and_then(Option::as_ref)
    }

    /// A node's application.
    pub fn application(&self, index: NodeIndex) -> Option<&RecordingApplication> {
        self.applications.get(index as usize).map(|a| &**a)
    }

    /// A node's storage.
    pub fn storage(&self, index: NodeIndex) -> Option<&MemoryDb> {
        self.storage.get(index as usize).map(|s| &**s)
    }

    /// Messages a node has broadcast.
    pub fn sent_messages(&self, index: NodeIndex) -> &[Message] {
        self.sent.get(index as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Messages of one kind a node has broadcast.
    pub fn sent_count(&self, index: NodeIndex, code: MessageCode) -> usize {
        self.sent_messages(index)
            .iter()
            .filter(|m| m.code == code)
            .count()
    }

    /// Last committed sequence of a running node.
    pub fn committed_sequence(&self, index: NodeIndex) -> Option<u64> {
        self.node(index).map(|n| n.committed().sequence)
    }

    /// Current view of a running node.
    pub fn current_view(&self, index: NodeIndex) -> Option<View> {
        self.node(index).map(|n| n.current_view())
    }

    /// Get a reference to the network.
    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Get a mutable reference to the network for partition/loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inputs
    // ═══════════════════════════════════════════════════════════════════════

    /// Submit a client request to one node.
    pub fn submit_request(&mut self, node: NodeIndex, payload: Vec<u8>) {
        let event = Event::RequestReceived {
            request: Request::new(payload),
        };
        self.schedule_event(node, self.now, event);
    }

    /// Submit a client request to every node.
    pub fn submit_request_to_all(&mut self, payload: Vec<u8>) {
        for node in self.network.all_nodes() {
            self.submit_request(node, payload.clone());
        }
    }

    /// Schedule an arbitrary event.
    pub fn schedule_initial_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let time = self.now + delay;
        self.schedule_event(node, time, event);
    }

    /// Stop a node. Its pending events and timers are discarded; storage and
    /// application survive.
    pub fn crash_node(&mut self, index: NodeIndex) {
        if let Some(slot) = self.nodes.get_mut(index as usize) {
            *slot = None;
            self.timers.retain(|(node, _), _| *node != index);
            self.event_queue.retain(|key, _| key.node_index != index);
            info!(node = index, time = ?self.now, "Node crashed");
        }
    }

    /// Restart a crashed node from its persisted state.
    pub fn restart_node(&mut self, index: NodeIndex) {
        let i = index as usize;
        if i >= self.nodes.len() || self.nodes[i].is_some() {
            return;
        }
        let recovered = match load_recovered_state(&*self.storage[i]) {
            Ok(recovered) => recovered,
            Err(e) => {
                warn!(node = index, error = %e, "Failed to load persisted state, starting fresh");
                RecoveredState::default()
            }
        };
        info!(
            node = index,
            committed = %recovered.committed,
            "Node restarted"
        );
        self.nodes[i] = Some(BftState::new(
            self.bft_config.clone(),
            self.backends[i].clone(),
            recovered,
        ));
        self.start_node(index);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Run simulation until no more events or time limit reached.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );

        while let Some(entry) = self.event_queue.first_entry() {
            if entry.key().time > end_time {
                debug!(
                    remaining_events = self.event_queue.len(),
                    "Time limit reached"
                );
                break;
            }
            let (key, event) = entry.remove_entry();
            self.now = key.time;
            let node_index = key.node_index;

            let Some(node) = self.nodes[node_index as usize].as_mut() else {
                self.stats.events_dropped_crashed += 1;
                continue;
            };
            if matches!(event, Event::ViewChangeTimer) {
                self.timers.remove(&(node_index, TimerId::ViewChange));
            }

            trace!(
                time = ?self.now,
                node = node_index,
                event = event.type_name(),
                "Processing event"
            );
            self.stats.events_processed += 1;
            self.stats.events_by_priority[event.priority() as usize] += 1;

            node.set_time(self.now);
            let actions = node.handle(event);
            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(node_index, action);
            }
        }

        if self.now < end_time {
            self.now = end_time;
        }
        trace!(
            events_processed = self.stats.events_processed,
            actions_generated = self.stats.actions_generated,
            final_time = ?self.now,
            "Simulation step complete"
        );
    }

    /// Process an action from a node.
    fn process_action(&mut self, from: NodeIndex, action: Action) {
        let index = from as usize;
        match action {
            Action::Broadcast { message } => {
                self.sent[index].push(message.clone());
                // Round-trip through the wire format so every hop exercises the codec.
                let payload = match message.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(node = from, error = %e, "Failed to encode message");
                        return;
                    }
                };
                for to in self.network.all_nodes() {
                    if to == from {
                        continue;
                    }
                    match Message::from_payload(&payload) {
                        Ok(message) => {
                            self.try_deliver_message(from, to, Event::MessageReceived { message })
                        }
                        Err(e) => warn!(node = from, error = %e, "Failed to decode message"),
                    }
                }
            }

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let event = match id {
                    TimerId::ViewChange => Event::ViewChangeTimer,
                };
                let key = self.schedule_event(from, self.now + duration, event);
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }

            // Delegated work executes instantly in simulation
            Action::CommitProposal { view, proposal } => {
                match self.applications[index].commit(view, &proposal) {
                    Ok(()) => self.stats.proposals_committed += 1,
                    Err(e) => warn!(node = from, error = %e, "Application rejected commit"),
                }
            }
            Action::BuildCheckpoint { view, digest } => {
                match self.applications[index].build_checkpoint(view, digest) {
                    Ok(()) => {
                        self.schedule_event(from, self.now, Event::CheckpointBuilt { view, digest });
                    }
                    Err(e) => warn!(node = from, error = %e, "Checkpoint build failed"),
                }
            }

            // Storage writes
            Action::PersistSnapshot { snapshot } => {
                if let Err(e) = persist_snapshot(&*self.storage[index], &snapshot) {
                    warn!(node = from, error = %e, "Failed to persist snapshot");
                }
            }
            Action::PersistCheckpoint { checkpoint } => {
                if let Err(e) = persist_checkpoint(&*self.storage[index], &checkpoint) {
                    warn!(node = from, error = %e, "Failed to persist checkpoint");
                }
            }
        }
    }

    /// Schedule an event.
    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Try to deliver a message, accounting for partitions and packet loss.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, event: Event) {
        // Check partition first (deterministic - doesn't consume RNG)
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from, to, "Message dropped due to partition");
            return;
        }

        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from, to, "Message dropped due to packet loss");
            return;
        }

        let latency = self.network.sample_latency(&mut self.rng);
        self.schedule_event(to, self.now + latency, event);
        self.stats.messages_sent += 1;
    }
}
