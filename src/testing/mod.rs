pub mod events;
pub mod graph;
pub mod identity;

pub use events::CollectingHandler;
pub use graph::{FailingStore, GraphHandle, VirtualGraph};
pub use identity::{test_identity, test_rng, test_seed};

use crate::node::Node;
use crate::time::ManualTimeProvider;

/// Runs a simulated swarm: each step delivers every pending subscription
/// update, polls every node, then advances the manual clock.
pub fn drive(
    nodes: &mut [(&mut Node<GraphHandle>, &GraphHandle)],
    time: &ManualTimeProvider,
    step_ms: i64,
    steps: usize,
) {
    for _ in 0..steps {
        for (node, handle) in nodes.iter_mut() {
            for (key, value) in handle.drain() {
                node.handle_update(&key, &value);
            }
            node.poll();
        }
        time.advance_ms(step_ms);
    }
}
