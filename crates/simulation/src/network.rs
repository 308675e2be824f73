//! Simulated network with deterministic latency, packet loss, and partitions.

use crate::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Number of validators.
    pub num_validators: u32,
    /// Base one-way latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this probability.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_validators: 4,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports:
/// - Configurable latency with jitter
/// - Packet loss (probabilistic message drops)
/// - Network partitions (blocking communication between node pairs)
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned node pairs. If (a, b) is in this set, messages from a to b are dropped.
    /// Partitions are directional - add both (a, b) and (b, a) for bidirectional partition.
    partitions: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimulatedNetwork {
    /// Create a new simulated network.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    // ─── Partition Management ───

    /// Check if two nodes are partitioned (message from `from` to `to` would be dropped).
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Create a unidirectional partition: messages from `from` to `to` are dropped.
    pub fn partition_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        self.partitions.insert((from, to));
    }

    /// Create a bidirectional partition between two nodes.
    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Create a bidirectional partition between two groups of nodes.
    pub fn partition_groups(&mut self, group_a: &[NodeIndex], group_b: &[NodeIndex]) {
        for &a in group_a {
            for &b in group_b {
                self.partition_bidirectional(a, b);
            }
        }
    }

    /// Isolate a node from all other nodes in the network.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        for other in self.all_nodes() {
            if other != node {
                self.partition_bidirectional(node, other);
            }
        }
    }

    /// Heal a bidirectional partition between two nodes.
    pub fn heal_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    /// Heal all partitions - restore full network connectivity.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    /// Get the number of active partition pairs.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Packet Loss ───

    /// Returns true if the packet should be dropped.
    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    /// Set the packet loss rate (0.0 - 1.0).
    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Get the current packet loss rate.
    pub fn packet_loss_rate(&self) -> f64 {
        self.config.packet_loss_rate
    }

    // ─── Latency ───

    /// Sample latency for one message.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.001))
    }

    /// Get all nodes in the network.
    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        (0..self.config.num_validators).collect()
    }

    /// Get the total number of nodes.
    pub fn total_nodes(&self) -> usize {
        self.config.num_validators as usize
    }

    /// Get network configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_latency_is_seeded() {
        let network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);

        assert_eq!(
            network.sample_latency(&mut rng1),
            network.sample_latency(&mut rng2),
            "Same seed should produce same latency"
        );
    }

    #[test]
    fn test_latency_without_jitter() {
        let network = SimulatedNetwork::new(NetworkConfig {
            jitter_fraction: 0.0,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(network.sample_latency(&mut rng), Duration::from_millis(10));
    }

    #[test]
    fn test_unidirectional_partition() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.partition_unidirectional(0, 1);

        assert!(network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(1, 0));
    }

    #[test]
    fn test_group_partition() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.partition_groups(&[0, 1], &[2, 3]);

        assert!(network.is_partitioned(0, 2));
        assert!(network.is_partitioned(3, 1));
        assert!(!network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(2, 3));

        network.heal_bidirectional(0, 2);
        assert!(!network.is_partitioned(2, 0));
        network.heal_all();
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn test_isolate_node() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.isolate_node(0);

        for other in 1..4 {
            assert!(network.is_partitioned(0, other));
            assert!(network.is_partitioned(other, 0));
        }
        assert!(!network.is_partitioned(1, 2));
        assert_eq!(network.partition_count(), 6);
    }

    #[test]
    fn test_packet_loss_rate() {
        let mut network = SimulatedNetwork::new(NetworkConfig {
            packet_loss_rate: 0.5,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let iterations = 10000;
        let drops = (0..iterations)
            .filter(|_| network.should_drop_packet(&mut rng))
            .count();
        let drop_rate = drops as f64 / iterations as f64;
        assert!(
            (0.45..0.55).contains(&drop_rate),
            "Expected ~50% drop rate, got {:.2}%",
            drop_rate * 100.0
        );

        network.set_packet_loss_rate(1.5);
        assert_eq!(network.packet_loss_rate(), 1.0);
        network.set_packet_loss_rate(-0.5);
        assert_eq!(network.packet_loss_rate(), 0.0);
    }
}
