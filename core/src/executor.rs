//! Sequential executor: one walk of the chain per inference.

use log::{error, trace};

use crate::arena::{ActivationsArena, WeightsArena};
use crate::context::NetworkConfig;
use crate::error::{Fault, NanoError, NanoResult};
use crate::graph::Graph;
use crate::layers::{LayerNode, NodeState};
use crate::math;
use crate::tensor::TensorDescriptor;

/// Run every node from the root to the terminal node, in chain order.
///
/// Stops at the first failing node and reports it; later nodes are not run,
/// so a failed pass never leaves a half-written output looking valid.
pub fn run_chain(
    graph: &mut Graph,
    weights: &WeightsArena<'_>,
    activations: &mut ActivationsArena<'_>,
    config: &NetworkConfig,
) -> NanoResult<()> {
    let root = graph.root();
    let (nodes, tensors) = graph.parts_mut();
    for node in nodes.iter_mut() {
        if node.state() == NodeState::Executed {
            node.set_state(NodeState::Ready);
        }
    }

    let limit = nodes.len();
    let mut steps = 0;
    let mut cursor = Some(root);
    while let Some(id) = cursor {
        let index = id.index();
        let node = nodes
            .get_mut(index)
            .ok_or(NanoError::InvalidGraph("chain points past the node table"))?;
        steps += 1;
        if steps > limit {
            return Err(NanoError::InvalidGraph("chain has a cycle"));
        }

        trace!("node {} ({}) forward", index, node.name());
        let result = node.forward(tensors, weights, activations).and_then(|()| {
            if config.check_numerics {
                check_finite(node, tensors, activations)
            } else {
                Ok(())
            }
        });
        if let Err(fault) = result {
            error!("node {} ({}) failed: {}", index, node.name(), fault);
            return Err(NanoError::Node {
                node: index,
                kind: node.name(),
                fault,
            });
        }
        cursor = node.next;
    }
    Ok(())
}

fn check_finite(
    node: &LayerNode,
    tensors: &[TensorDescriptor],
    activations: &ActivationsArena<'_>,
) -> Result<(), Fault> {
    let output = tensors
        .get(node.output.index())
        .ok_or(Fault::MissingTensor { role: "output" })?;
    let values = activations.f32(output.data_handle())?;
    match math::first_non_finite(values) {
        Some(index) => Err(Fault::NonFinite { index }),
        None => Ok(()),
    }
}
