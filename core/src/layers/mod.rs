//! Layer nodes: the typed computational units of the execution chain.
//!
//! A node owns no data. It names its tensors by [`TensorId`] (inputs, one
//! output, weights, scratch) and carries the layer parameters. At run time
//! it borrows the graph's tensor table through a [`NodeIo`] and the two
//! arenas, and calls into the kernel library.

pub mod activations;
pub mod conv;
pub mod dense;
pub mod pooling;

use crate::arena::{ActivationsArena, WeightsArena};
use crate::error::{Fault, NanoError, NanoResult};
use crate::tensor::{ArenaKind, Format, Shape, TensorDescriptor, TensorId};

pub use crate::math::{Activation, PoolGeometry, PoolKind};
pub use activations::Nonlinearity;
pub use conv::Conv2d;
pub use dense::Dense;
pub use pooling::Pool2d;

/// Most tensors a node may reference in one role (inputs, weights, scratch).
pub const MAX_NODE_TENSORS: usize = 4;

/// Behaviour shared by every layer kind.
pub trait Layer {
    /// Short lowercase name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Shape produced from an input of `input` shape.
    fn output_shape(&self, input: &Shape) -> Result<Shape, Fault>;

    /// f32 elements each scratch buffer needs; zero means unused.
    fn scratch_elements(&self, _input: &Shape) -> [usize; 2] {
        [0, 0]
    }

    /// Multiply-accumulate count of one forward pass.
    fn macc(&self, input: &Shape, output: &Shape) -> u64;

    /// Check formats, arenas, shapes and scratch sizes of the node's tensors.
    fn validate(&self, io: &NodeIo<'_>) -> Result<(), Fault>;

    /// Read the inputs, run the kernel, write the output.
    fn forward(
        &self,
        io: &NodeIo<'_>,
        weights: &WeightsArena<'_>,
        activations: &mut ActivationsArena<'_>,
    ) -> Result<(), Fault>;
}

/// The layer-kind tag plus its numeric parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Convolution, bias, activation and optional pooling in one pass.
    Conv2d(Conv2d),
    Pool(Pool2d),
    Dense(Dense),
    Nonlinearity(Nonlinearity),
}

impl Layer for LayerKind {
    fn name(&self) -> &'static str {
        match self {
            LayerKind::Conv2d(l) => l.name(),
            LayerKind::Pool(l) => l.name(),
            LayerKind::Dense(l) => l.name(),
            LayerKind::Nonlinearity(l) => l.name(),
        }
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, Fault> {
        match self {
            LayerKind::Conv2d(l) => l.output_shape(input),
            LayerKind::Pool(l) => l.output_shape(input),
            LayerKind::Dense(l) => l.output_shape(input),
            LayerKind::Nonlinearity(l) => l.output_shape(input),
        }
    }

    fn scratch_elements(&self, input: &Shape) -> [usize; 2] {
        match self {
            LayerKind::Conv2d(l) => l.scratch_elements(input),
            LayerKind::Pool(l) => l.scratch_elements(input),
            LayerKind::Dense(l) => l.scratch_elements(input),
            LayerKind::Nonlinearity(l) => l.scratch_elements(input),
        }
    }

    fn macc(&self, input: &Shape, output: &Shape) -> u64 {
        match self {
            LayerKind::Conv2d(l) => l.macc(input, output),
            LayerKind::Pool(l) => l.macc(input, output),
            LayerKind::Dense(l) => l.macc(input, output),
            LayerKind::Nonlinearity(l) => l.macc(input, output),
        }
    }

    fn validate(&self, io: &NodeIo<'_>) -> Result<(), Fault> {
        match self {
            LayerKind::Conv2d(l) => l.validate(io),
            LayerKind::Pool(l) => l.validate(io),
            LayerKind::Dense(l) => l.validate(io),
            LayerKind::Nonlinearity(l) => l.validate(io),
        }
    }

    fn forward(
        &self,
        io: &NodeIo<'_>,
        weights: &WeightsArena<'_>,
        activations: &mut ActivationsArena<'_>,
    ) -> Result<(), Fault> {
        match self {
            LayerKind::Conv2d(l) => l.forward(io, weights, activations),
            LayerKind::Pool(l) => l.forward(io, weights, activations),
            LayerKind::Dense(l) => l.forward(io, weights, activations),
            LayerKind::Nonlinearity(l) => l.forward(io, weights, activations),
        }
    }
}

/// Index of a node in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u16);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-inference node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Tensors not yet bound to arenas.
    #[default]
    Unbound,
    Ready,
    Executed,
}

/// A fixed-capacity list of tensor references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorList {
    ids: [TensorId; MAX_NODE_TENSORS],
    len: u8,
}

impl TensorList {
    pub const fn new() -> Self {
        Self {
            ids: [TensorId(0); MAX_NODE_TENSORS],
            len: 0,
        }
    }

    pub fn from_slice(ids: &[TensorId]) -> NanoResult<Self> {
        let mut list = Self::new();
        for &id in ids {
            list.push(id)?;
        }
        Ok(list)
    }

    pub fn push(&mut self, id: TensorId) -> NanoResult<()> {
        let len = self.len as usize;
        if len == MAX_NODE_TENSORS {
            return Err(NanoError::CapacityExceeded {
                what: "tensors per node role",
                limit: MAX_NODE_TENSORS,
            });
        }
        self.ids[len] = id;
        self.len += 1;
        Ok(())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<TensorId> {
        self.as_slice().get(index).copied()
    }

    pub fn as_slice(&self) -> &[TensorId] {
        &self.ids[..self.len as usize]
    }
}

/// One node of the execution chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerNode {
    pub layer: LayerKind,
    pub inputs: TensorList,
    pub output: TensorId,
    pub weights: TensorList,
    pub scratch: TensorList,
    /// Predecessor in the chain; introspection only.
    pub prev: Option<NodeId>,
    /// Successor in the chain; `None` at the terminal node.
    pub next: Option<NodeId>,
    state: NodeState,
}

impl LayerNode {
    pub const fn new(
        layer: LayerKind,
        inputs: TensorList,
        output: TensorId,
        weights: TensorList,
        scratch: TensorList,
    ) -> Self {
        Self {
            layer,
            inputs,
            output,
            weights,
            scratch,
            prev: None,
            next: None,
            state: NodeState::Unbound,
        }
    }

    pub fn name(&self) -> &'static str {
        self.layer.name()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub fn validate(&self, tensors: &[TensorDescriptor]) -> Result<(), Fault> {
        self.layer.validate(&NodeIo::new(self, tensors))
    }

    /// Run the node: `Ready → Executed` on success.
    pub fn forward(
        &mut self,
        tensors: &[TensorDescriptor],
        weights: &WeightsArena<'_>,
        activations: &mut ActivationsArena<'_>,
    ) -> Result<(), Fault> {
        if self.state == NodeState::Unbound {
            return Err(Fault::NotInitialized);
        }
        self.layer.forward(&NodeIo::new(self, tensors), weights, activations)?;
        self.state = NodeState::Executed;
        Ok(())
    }
}

/// A node's view of the graph's tensor table while it runs.
#[derive(Debug, Clone, Copy)]
pub struct NodeIo<'g> {
    node: &'g LayerNode,
    tensors: &'g [TensorDescriptor],
}

impl<'g> NodeIo<'g> {
    pub fn new(node: &'g LayerNode, tensors: &'g [TensorDescriptor]) -> Self {
        Self { node, tensors }
    }

    fn lookup(
        &self,
        id: Option<TensorId>,
        role: &'static str,
    ) -> Result<&'g TensorDescriptor, Fault> {
        id.and_then(|id| self.tensors.get(id.index()))
            .ok_or(Fault::MissingTensor { role })
    }

    pub fn input(&self, index: usize) -> Result<&'g TensorDescriptor, Fault> {
        self.lookup(self.node.inputs.get(index), "input")
    }

    pub fn output(&self) -> Result<&'g TensorDescriptor, Fault> {
        self.lookup(Some(self.node.output), "output")
    }

    pub fn weight(&self, index: usize) -> Result<&'g TensorDescriptor, Fault> {
        self.lookup(self.node.weights.get(index), "weight")
    }

    /// A weight slot the layer may leave empty (bias).
    pub fn optional_weight(&self, index: usize) -> Result<Option<&'g TensorDescriptor>, Fault> {
        match self.node.weights.get(index) {
            None => Ok(None),
            id => self.lookup(id, "weight").map(Some),
        }
    }

    pub fn scratch(&self, index: usize) -> Result<&'g TensorDescriptor, Fault> {
        self.lookup(self.node.scratch.get(index), "scratch")
    }
}

// -- validation helpers shared by the layer kinds --

pub(crate) fn expect_arena(tensor: &TensorDescriptor, arena: ArenaKind) -> Result<(), Fault> {
    if tensor.buffer.arena != arena {
        return Err(Fault::WrongArena {
            actual: tensor.buffer.arena,
        });
    }
    Ok(())
}

/// Format, arena, and a buffer big enough for the declared shape.
pub(crate) fn expect_tensor(
    tensor: &TensorDescriptor,
    format: Format,
    arena: ArenaKind,
) -> Result<(), Fault> {
    if tensor.format != format {
        return Err(Fault::UnsupportedFormat);
    }
    expect_arena(tensor, arena)?;
    let available = tensor.buffer.handle.len();
    if available < tensor.byte_size() {
        return Err(Fault::BufferTooSmall {
            required: tensor.byte_size(),
            available,
        });
    }
    Ok(())
}

pub(crate) fn expect_shape(tensor: &TensorDescriptor, expected: Shape) -> Result<(), Fault> {
    if tensor.shape != expected {
        return Err(Fault::ShapeMismatch {
            expected,
            actual: tensor.shape,
        });
    }
    Ok(())
}

/// Float activation input/output of a node.
pub(crate) fn expect_activation(tensor: &TensorDescriptor) -> Result<(), Fault> {
    expect_tensor(tensor, Format::F32, ArenaKind::Activations)
}

/// Scratch holding at least `elements` floats.
pub(crate) fn expect_scratch(tensor: &TensorDescriptor, elements: usize) -> Result<(), Fault> {
    expect_activation(tensor)?;
    if tensor.element_count() < elements {
        return Err(Fault::BufferTooSmall {
            required: elements * 4,
            available: tensor.byte_size(),
        });
    }
    Ok(())
}

/// Spatial layers run one image at a time.
pub(crate) fn expect_single_batch(shape: &Shape) -> Result<(), Fault> {
    if shape.batch != 1 {
        return Err(Fault::InvalidParameter("batch must be 1"));
    }
    Ok(())
}
