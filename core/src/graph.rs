//! The static layer graph: tensor table, node chain, arena sizes.
//!
//! A [`Graph`] is pure metadata. It is built once by [`GraphBuilder`] (or
//! decoded from a table, see [`crate::table`]), validated, and after that
//! only its resolved addresses and node states ever change.
//!
//! Execution order is a linear chain of node indices starting at the root.
//! Each node's first input is the previous node's output; the first node
//! reads the graph input and the terminal node writes the graph output.

use log::debug;

use crate::arena::{ArenaLayout, Handle, ARENA_ALIGN};
use crate::error::{NanoError, NanoResult};
use crate::layers::{
    Conv2d, Dense, Layer, LayerKind, LayerNode, Nonlinearity, NodeId, NodeState, Pool2d,
    PoolGeometry, TensorList,
};
use crate::planner::{find_conflict, plan_offsets, LiveInterval, PlanRequest};
use crate::tensor::{ArenaKind, Format, Shape, Strides, TensorDescriptor, TensorId};

/// Most nodes a graph can hold.
pub const MAX_NODES: usize = 16;

/// Most tensors a graph can hold (inputs, outputs, weights, scratch).
pub const MAX_TENSORS: usize = 48;

const EMPTY_TENSOR: TensorDescriptor =
    TensorDescriptor::new(Format::F32, Shape::new(0, 0, 0, 0), ArenaKind::Activations);

const EMPTY_NODE: LayerNode = LayerNode::new(
    LayerKind::Nonlinearity(Nonlinearity::Relu),
    TensorList::new(),
    TensorId(0),
    TensorList::new(),
    TensorList::new(),
);

/// Static model metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: &'static str,
    pub signature: u32,
    pub weights_size: usize,
    pub activations_size: usize,
    pub node_count: usize,
    pub tensor_count: usize,
    pub input: Shape,
    pub output: Shape,
    pub macc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    pub(crate) name: &'static str,
    pub(crate) signature: u32,
    pub(crate) tensors: [TensorDescriptor; MAX_TENSORS],
    pub(crate) tensor_count: usize,
    pub(crate) nodes: [LayerNode; MAX_NODES],
    pub(crate) node_count: usize,
    pub(crate) root: NodeId,
    pub(crate) input: TensorId,
    pub(crate) output: TensorId,
    pub(crate) weights_size: usize,
    pub(crate) activations_size: usize,
}

impl Graph {
    pub(crate) const fn empty(name: &'static str, signature: u32) -> Self {
        Self {
            name,
            signature,
            tensors: [EMPTY_TENSOR; MAX_TENSORS],
            tensor_count: 0,
            nodes: [EMPTY_NODE; MAX_NODES],
            node_count: 0,
            root: NodeId(0),
            input: TensorId(0),
            output: TensorId(0),
            weights_size: 0,
            activations_size: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name,
            signature: self.signature,
            weights_size: self.weights_size,
            activations_size: self.activations_size,
            node_count: self.node_count,
            tensor_count: self.tensor_count,
            input: self.input_descriptor().shape,
            output: self.output_descriptor().shape,
            macc: self.macc(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn tensor_count(&self) -> usize {
        self.tensor_count
    }

    /// Bytes the weights arena must provide.
    pub fn weights_size(&self) -> usize {
        self.weights_size
    }

    /// Bytes the activations arena must provide.
    pub fn activations_size(&self) -> usize {
        self.activations_size
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn input(&self) -> TensorId {
        self.input
    }

    pub fn output(&self) -> TensorId {
        self.output
    }

    pub fn input_descriptor(&self) -> &TensorDescriptor {
        &self.tensors[self.input.index()]
    }

    pub fn output_descriptor(&self) -> &TensorDescriptor {
        &self.tensors[self.output.index()]
    }

    pub fn tensors(&self) -> &[TensorDescriptor] {
        &self.tensors[..self.tensor_count]
    }

    pub fn tensor(&self, id: TensorId) -> Option<&TensorDescriptor> {
        self.tensors().get(id.index())
    }

    /// Direct access to a descriptor.
    ///
    /// Skips every build-time check; a node given inconsistent metadata
    /// faults when it runs.
    pub fn tensor_mut(&mut self, id: TensorId) -> Option<&mut TensorDescriptor> {
        self.tensors[..self.tensor_count].get_mut(id.index())
    }

    pub fn node(&self, id: NodeId) -> Option<&LayerNode> {
        self.nodes[..self.node_count].get(id.index())
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> Chain<'_> {
        Chain {
            graph: self,
            cursor: Some(self.root),
            remaining: self.node_count,
        }
    }

    /// Total multiply-accumulates of one forward pass.
    pub fn macc(&self) -> u64 {
        self.nodes()
            .map(|(_, node)| {
                let input = node
                    .inputs
                    .get(0)
                    .and_then(|id| self.tensor(id))
                    .map(|t| t.shape)
                    .unwrap_or_default();
                let output = self.tensor(node.output).map(|t| t.shape).unwrap_or_default();
                node.layer.macc(&input, &output)
            })
            .sum()
    }

    /// Lifetime of every activation tensor, in chain steps.
    ///
    /// Step 0 is the caller writing the input; node `k` in chain order runs
    /// at step `k + 1`. The graph output stays live one step past the
    /// terminal node. Tensors no node touches get `None`.
    pub fn liveness(&self) -> [Option<LiveInterval>; MAX_TENSORS] {
        let mut live = [None; MAX_TENSORS];
        let mut touch = |id: TensorId, step: usize| {
            if let Some(slot) = live.get_mut(id.index()) {
                match slot {
                    Some(interval) => LiveInterval::extend_to(interval, step),
                    None => *slot = Some(LiveInterval::at(step)),
                }
            }
        };

        touch(self.input, 0);
        let mut last = 0;
        for (position, (_, node)) in self.nodes().enumerate() {
            let step = position + 1;
            for &id in node.inputs.as_slice().iter().chain(node.scratch.as_slice()) {
                touch(id, step);
            }
            touch(node.output, step);
            last = step;
        }
        touch(self.output, last + 1);

        for (slot, tensor) in live.iter_mut().zip(&self.tensors[..self.tensor_count]) {
            if tensor.buffer.is_const() {
                *slot = None;
            }
        }
        live
    }

    /// Full static check: chain shape, node metadata, placement, aliasing.
    pub fn validate(&self) -> NanoResult<()> {
        if self.node_count == 0 {
            return Err(NanoError::InvalidGraph("graph has no nodes"));
        }
        let known = |id: TensorId| id.index() < self.tensor_count;
        if !known(self.input) || !known(self.output) {
            return Err(NanoError::InvalidGraph("graph input or output is not in the tensor table"));
        }
        if self.input_descriptor().buffer.is_const() || self.output_descriptor().buffer.is_const() {
            return Err(NanoError::InvalidGraph(
                "graph input and output must live in the activations arena",
            ));
        }

        self.validate_placement()?;
        self.validate_chain(known)?;
        self.validate_aliasing()
    }

    fn validate_chain(&self, known: impl Fn(TensorId) -> bool) -> NanoResult<()> {
        let mut visited = 0;
        let mut prev = None;
        let mut expected_input = self.input;
        let mut cursor = Some(self.root);

        while let Some(id) = cursor {
            let node = self
                .node(id)
                .ok_or(NanoError::InvalidGraph("chain points past the node table"))?;
            visited += 1;
            if visited > self.node_count {
                return Err(NanoError::InvalidGraph("chain has a cycle"));
            }
            if node.prev != prev {
                return Err(NanoError::InvalidGraph("back-reference does not match chain order"));
            }
            let mut refs = node
                .inputs
                .as_slice()
                .iter()
                .chain(node.weights.as_slice())
                .chain(node.scratch.as_slice());
            if !known(node.output) || !refs.all(|&t| known(t)) {
                return Err(NanoError::InvalidGraph("node references an unknown tensor"));
            }
            if node.inputs.get(0) != Some(expected_input) {
                return Err(NanoError::InvalidGraph("node input is not the previous node's output"));
            }
            node.validate(self.tensors()).map_err(|fault| NanoError::InvalidNode {
                node: id.index(),
                kind: node.name(),
                fault,
            })?;

            expected_input = node.output;
            prev = Some(id);
            cursor = node.next;
        }

        if visited != self.node_count {
            return Err(NanoError::InvalidGraph("chain does not reach every node"));
        }
        if expected_input != self.output {
            return Err(NanoError::InvalidGraph("terminal node does not write the graph output"));
        }
        Ok(())
    }

    /// Sizes, bounds, alignment and strides of every tensor. Runs before
    /// any node looks at a shape, so later arithmetic can't overflow.
    fn validate_placement(&self) -> NanoResult<()> {
        for tensor in self.tensors() {
            let size = tensor
                .checked_byte_size()
                .ok_or(NanoError::InvalidGraph("tensor size overflows"))?;
            if tensor.element_count() == 0 {
                return Err(NanoError::InvalidGraph("tensor has no elements"));
            }
            let handle = tensor.buffer.handle;
            if handle.len() < size {
                return Err(NanoError::BufferTooSmall {
                    required: size,
                    available: handle.len(),
                });
            }
            let limit = match tensor.buffer.arena {
                ArenaKind::Weights => self.weights_size,
                ArenaKind::Activations => self.activations_size,
            };
            let end = handle
                .checked_end()
                .ok_or(NanoError::InvalidGraph("tensor size overflows"))?;
            if end > limit {
                return Err(NanoError::InvalidGraph("tensor lies outside its arena"));
            }
            if handle.offset() % ARENA_ALIGN != 0 {
                return Err(NanoError::InvalidGraph("tensor offset is not 4-byte aligned"));
            }
            if tensor.strides != Strides::packed(&tensor.shape, tensor.format.element_size()) {
                return Err(NanoError::InvalidGraph("tensor strides are not packed channel-last"));
            }
        }
        Ok(())
    }

    /// Weights never share bytes; activations only when their lifetimes
    /// are disjoint.
    fn validate_aliasing(&self) -> NanoResult<()> {
        let live = self.liveness();
        for arena in [ArenaKind::Weights, ArenaKind::Activations] {
            let mut requests = [PlanRequest::new(0, LiveInterval::at(0)); MAX_TENSORS];
            let mut count = 0;
            for (index, tensor) in self.tensors().iter().enumerate() {
                if tensor.buffer.arena != arena {
                    continue;
                }
                // weights are read by every step; untouched activations by none
                let interval = match arena {
                    ArenaKind::Weights => LiveInterval::new(0, usize::MAX),
                    ArenaKind::Activations => match live[index] {
                        Some(interval) => interval,
                        None => continue,
                    },
                };
                let handle = tensor.buffer.handle;
                requests[count] = PlanRequest::placed(handle.offset(), handle.len(), interval);
                count += 1;
            }
            if find_conflict(&requests[..count]).is_some() {
                return Err(NanoError::InvalidGraph("live tensors share arena bytes"));
            }
        }
        Ok(())
    }

    /// Record `base + offset` in every descriptor of `arena`.
    pub(crate) fn bind_arena(&mut self, arena: ArenaKind, base: usize) {
        for tensor in self.tensors[..self.tensor_count].iter_mut() {
            if tensor.buffer.arena == arena {
                tensor.resolve(base);
            }
        }
    }

    pub(crate) fn unbind(&mut self) {
        for tensor in self.tensors[..self.tensor_count].iter_mut() {
            tensor.unresolve();
        }
        self.set_node_states(NodeState::Unbound);
    }

    pub(crate) fn set_node_states(&mut self, state: NodeState) {
        for node in self.nodes[..self.node_count].iter_mut() {
            node.set_state(state);
        }
    }

    /// Nodes and tensors borrowed separately, for the executor.
    pub(crate) fn parts_mut(&mut self) -> (&mut [LayerNode], &[TensorDescriptor]) {
        (&mut self.nodes[..self.node_count], &self.tensors[..self.tensor_count])
    }

    /// Link nodes `0..node_count` in index order, root first.
    pub(crate) fn link_in_order(&mut self) {
        let count = self.node_count;
        for (i, node) in self.nodes[..count].iter_mut().enumerate() {
            node.prev = if i == 0 { None } else { Some(NodeId(i as u16 - 1)) };
            node.next = if i + 1 == count { None } else { Some(NodeId(i as u16 + 1)) };
        }
        self.root = NodeId(0);
    }

    pub(crate) fn push_tensor(&mut self, tensor: TensorDescriptor) -> NanoResult<TensorId> {
        if self.tensor_count == MAX_TENSORS {
            return Err(NanoError::CapacityExceeded {
                what: "tensors",
                limit: MAX_TENSORS,
            });
        }
        let id = TensorId(self.tensor_count as u16);
        self.tensors[self.tensor_count] = tensor;
        self.tensor_count += 1;
        Ok(id)
    }

    pub(crate) fn push_node(&mut self, node: LayerNode) -> NanoResult<NodeId> {
        if self.node_count == MAX_NODES {
            return Err(NanoError::CapacityExceeded {
                what: "nodes",
                limit: MAX_NODES,
            });
        }
        let id = NodeId(self.node_count as u16);
        self.nodes[self.node_count] = node;
        self.node_count += 1;
        Ok(id)
    }
}

/// Chain-order iterator over a graph's nodes.
pub struct Chain<'g> {
    graph: &'g Graph,
    cursor: Option<NodeId>,
    remaining: usize,
}

impl<'g> Iterator for Chain<'g> {
    type Item = (NodeId, &'g LayerNode);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.cursor?;
        let node = self.graph.node(id)?;
        self.cursor = node.next;
        self.remaining -= 1;
        Some((id, node))
    }
}

/// Builds a [`Graph`] node by node.
///
/// Weights are laid out as they are declared (4-byte aligned bump
/// allocation). Activation offsets are planned in [`build`](Self::build)
/// once every lifetime is known.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    graph: Graph,
    weights: ArenaLayout,
    has_input: bool,
    /// Output of the last node added, i.e. the only tensor the next node may read.
    head: Option<TensorId>,
}

impl GraphBuilder {
    pub fn new(name: &'static str, signature: u32) -> Self {
        Self {
            graph: Graph::empty(name, signature),
            weights: ArenaLayout::new(),
            has_input: false,
            head: None,
        }
    }

    /// Declare the network input.
    pub fn input(&mut self, shape: Shape) -> NanoResult<TensorId> {
        if self.has_input {
            return Err(NanoError::InvalidGraph("input already declared"));
        }
        if shape.element_count() == 0 {
            return Err(NanoError::InvalidParameter("input shape has a zero dimension"));
        }
        let id = self.activation(shape)?;
        self.graph.input = id;
        self.has_input = true;
        self.head = Some(id);
        Ok(id)
    }

    /// Declare a constant tensor and reserve its bytes in the weights arena.
    pub fn weights(&mut self, format: Format, shape: Shape) -> NanoResult<TensorId> {
        if shape.element_count() == 0 {
            return Err(NanoError::InvalidParameter("weight shape has a zero dimension"));
        }
        let mut tensor = TensorDescriptor::new(format, shape, ArenaKind::Weights);
        tensor.buffer.handle = self.weights.allocate(tensor.byte_size());
        self.graph.push_tensor(tensor)
    }

    pub fn conv2d(
        &mut self,
        input: TensorId,
        conv: Conv2d,
        weights: TensorId,
        bias: Option<TensorId>,
    ) -> NanoResult<TensorId> {
        let mut constants = TensorList::from_slice(&[weights])?;
        if let Some(bias) = bias {
            constants.push(bias)?;
        }
        self.push(LayerKind::Conv2d(conv), input, constants)
    }

    pub fn pool(&mut self, input: TensorId, geometry: PoolGeometry) -> NanoResult<TensorId> {
        self.push(LayerKind::Pool(Pool2d::new(geometry)), input, TensorList::new())
    }

    pub fn dense(
        &mut self,
        input: TensorId,
        dense: Dense,
        weights: TensorId,
        bias: Option<TensorId>,
    ) -> NanoResult<TensorId> {
        let mut constants = TensorList::from_slice(&[weights])?;
        if let Some(bias) = bias {
            constants.push(bias)?;
        }
        self.push(LayerKind::Dense(dense), input, constants)
    }

    pub fn nonlinearity(&mut self, input: TensorId, kind: Nonlinearity) -> NanoResult<TensorId> {
        self.push(LayerKind::Nonlinearity(kind), input, TensorList::new())
    }

    fn activation(&mut self, shape: Shape) -> NanoResult<TensorId> {
        self.graph
            .push_tensor(TensorDescriptor::new(Format::F32, shape, ArenaKind::Activations))
    }

    fn push(
        &mut self,
        layer: LayerKind,
        input: TensorId,
        weights: TensorList,
    ) -> NanoResult<TensorId> {
        if self.head != Some(input) {
            return Err(NanoError::InvalidGraph("node input is not the previous node's output"));
        }
        let index = self.graph.node_count;
        let input_shape = self
            .graph
            .tensor(input)
            .map(|t| t.shape)
            .ok_or(NanoError::InvalidGraph("unknown input tensor"))?;
        let output_shape = layer.output_shape(&input_shape).map_err(|fault| NanoError::InvalidNode {
            node: index,
            kind: layer.name(),
            fault,
        })?;

        let output = self.activation(output_shape)?;
        let mut scratch = TensorList::new();
        for elements in layer.scratch_elements(&input_shape) {
            if elements > 0 {
                scratch.push(self.activation(Shape::vector(elements))?)?;
            }
        }

        let inputs = TensorList::from_slice(&[input])?;
        self.graph
            .push_node(LayerNode::new(layer, inputs, output, weights, scratch))?;
        self.head = Some(output);
        Ok(output)
    }

    /// Plan the activations arena, link the chain and validate everything.
    pub fn build(self) -> NanoResult<Graph> {
        let Self {
            mut graph,
            weights,
            has_input,
            head,
        } = self;
        if !has_input {
            return Err(NanoError::InvalidGraph("no input declared"));
        }
        if graph.node_count == 0 {
            return Err(NanoError::InvalidGraph("graph has no nodes"));
        }
        graph.output = head.ok_or(NanoError::InvalidGraph("graph has no output"))?;
        graph.link_in_order();
        graph.weights_size = weights.size();
        graph.activations_size = plan_activations(&mut graph);

        graph.validate()?;
        debug!(
            "graph '{}': {} nodes, {} tensors, weights {} B, activations {} B",
            graph.name,
            graph.node_count,
            graph.tensor_count,
            graph.weights_size,
            graph.activations_size
        );
        Ok(graph)
    }
}

/// Assign offsets to every activation tensor; returns the arena size.
fn plan_activations(graph: &mut Graph) -> usize {
    let live = graph.liveness();
    let mut requests = [PlanRequest::new(0, LiveInterval::at(0)); MAX_TENSORS];
    let mut ids = [0usize; MAX_TENSORS];
    let mut count = 0;

    for (index, tensor) in graph.tensors().iter().enumerate() {
        if let Some(interval) = live[index] {
            requests[count] = PlanRequest::new(tensor.byte_size(), interval);
            ids[count] = index;
            count += 1;
        }
    }

    let mut order = [0usize; MAX_TENSORS];
    let total = plan_offsets(&mut requests[..count], &mut order);
    for (request, &index) in requests[..count].iter().zip(&ids[..count]) {
        graph.tensors[index].buffer.handle = Handle::new(request.offset, request.size);
    }
    total
}
