//! NetworkContext: one graph bound to one weights/activations arena pair.
//!
//! The caller owns both regions and lends them for the life of the binding.
//! Weights are borrowed shared, so any number of contexts can run from the
//! same blob; activations are borrowed exclusively, one pass at a time.
//!
//! ```text
//! Uninitialized ──init──▶ Bound ──▶ Ready ──run_forward──▶ Running ──▶ Ready
//!                                                             │
//!                                                             └─fault─▶ Faulted
//! ```
//!
//! `Faulted` is sticky: only a fresh `init` leaves it.

use log::{debug, info, warn};

use crate::arena::{ActivationsArena, WeightsArena};
use crate::error::{NanoError, NanoResult};
use crate::executor;
use crate::graph::{Graph, ModelInfo};
use crate::layers::NodeState;
use crate::math;
use crate::tensor::ArenaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkState {
    #[default]
    Uninitialized,
    Bound,
    Ready,
    Running,
    Faulted,
}

/// Run-time options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkConfig {
    /// Scan each node's output for NaN/infinity and fault on the first one.
    pub check_numerics: bool,
}

/// What `init` needs: the expected model signature and the two regions.
#[derive(Debug)]
pub struct NetworkParams<'w, 'a> {
    pub signature: u32,
    pub weights: &'w [u8],
    pub activations: &'a mut [u8],
}

#[derive(Debug)]
pub struct NetworkContext<'w, 'a> {
    graph: Graph,
    config: NetworkConfig,
    state: NetworkState,
    weights: Option<WeightsArena<'w>>,
    activations: Option<ActivationsArena<'a>>,
    /// Last pass completed; the output tensor holds its result.
    has_output: bool,
}

impl<'w, 'a> NetworkContext<'w, 'a> {
    pub fn create(graph: Graph) -> Self {
        Self::with_config(graph, NetworkConfig::default())
    }

    pub fn with_config(graph: Graph, config: NetworkConfig) -> Self {
        Self {
            graph,
            config,
            state: NetworkState::Uninitialized,
            weights: None,
            activations: None,
            has_output: false,
        }
    }

    /// Bind both arenas and make the network runnable.
    ///
    /// Replaces any previous binding, and is the only way out of `Faulted`.
    /// On failure the context is left `Uninitialized`.
    pub fn init(&mut self, params: NetworkParams<'w, 'a>) -> NanoResult<()> {
        self.unbind();

        let info = self.graph.info();
        if params.signature != info.signature {
            return Err(NanoError::SignatureMismatch {
                expected: info.signature,
                actual: params.signature,
            });
        }
        let weights = WeightsArena::bind(params.weights, info.weights_size)?;
        let activations = ActivationsArena::bind(params.activations, info.activations_size)?;

        self.graph.bind_arena(ArenaKind::Weights, weights.base_addr());
        debug!("weights arena bound at {:#x} ({} B)", weights.base_addr(), weights.capacity());
        self.graph.bind_arena(ArenaKind::Activations, activations.base_addr());
        debug!(
            "activations arena bound at {:#x} ({} B)",
            activations.base_addr(),
            activations.capacity()
        );
        self.weights = Some(weights);
        self.activations = Some(activations);
        self.state = NetworkState::Bound;

        self.graph.set_node_states(NodeState::Ready);
        self.state = NetworkState::Ready;
        info!(
            "network '{}' ready: {} nodes, {} MACC",
            info.name, info.node_count, info.macc
        );
        Ok(())
    }

    /// Copy `input` into the input tensor and run the chain.
    pub fn run_forward(&mut self, input: &[f32]) -> NanoResult<&[f32]> {
        self.check_runnable()?;
        let expected = self.graph.input_descriptor().element_count();
        if input.len() != expected {
            return Err(NanoError::InvalidInputLength {
                expected,
                actual: input.len(),
            });
        }
        self.input_mut()?.copy_from_slice(input);
        self.execute()?;
        self.output()
    }

    /// The input tensor's bytes in the activations arena, for writing the
    /// input in place before [`run_forward_in_place`](Self::run_forward_in_place).
    ///
    /// A pass may reuse those bytes for later tensors, so write the input
    /// again before every pass.
    pub fn input_mut(&mut self) -> NanoResult<&mut [f32]> {
        self.check_runnable()?;
        let handle = self.graph.input_descriptor().data_handle();
        let activations = self.activations.as_mut().ok_or(NanoError::NotInitialized)?;
        activations
            .f32_mut(handle)
            .map_err(|_| NanoError::InvalidGraph("input tensor lies outside the activations arena"))
    }

    /// Run the chain on whatever the input tensor holds.
    pub fn run_forward_in_place(&mut self) -> NanoResult<&[f32]> {
        self.check_runnable()?;
        self.execute()?;
        self.output()
    }

    /// Result of the last successful pass.
    pub fn output(&self) -> NanoResult<&[f32]> {
        match self.state {
            NetworkState::Faulted => return Err(NanoError::Faulted),
            NetworkState::Ready if self.has_output => {}
            NetworkState::Ready => return Err(NanoError::NoOutput),
            _ => return Err(NanoError::NotInitialized),
        }
        let handle = self.graph.output_descriptor().data_handle();
        let activations = self.activations.as_ref().ok_or(NanoError::NotInitialized)?;
        activations
            .f32(handle)
            .map_err(|_| {
                NanoError::InvalidGraph("output tensor lies outside the activations arena")
            })
    }

    /// Forward pass, then the index of the largest output.
    pub fn predict(&mut self, input: &[f32]) -> NanoResult<usize> {
        let output = self.run_forward(input)?;
        math::argmax_f32(output).ok_or(NanoError::NoOutput)
    }

    /// Unbind and hand the regions back, e.g. to `init` again.
    pub fn release(&mut self) -> NanoResult<NetworkParams<'w, 'a>> {
        let weights = self.weights.take();
        let activations = self.activations.take();
        self.unbind();
        match (weights, activations) {
            (Some(weights), Some(activations)) => {
                info!("network '{}' released", self.graph.name());
                Ok(NetworkParams {
                    signature: self.graph.signature(),
                    weights: weights.into_inner(),
                    activations: activations.into_inner(),
                })
            }
            _ => Err(NanoError::NotInitialized),
        }
    }

    /// Drop the context. Caller-owned memory comes back if it was bound.
    pub fn destroy(mut self) -> Option<NetworkParams<'w, 'a>> {
        self.release().ok()
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn info(&self) -> ModelInfo {
        self.graph.info()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph metadata. Nothing is re-validated; a node given
    /// inconsistent metadata faults on the next pass.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    fn check_runnable(&self) -> NanoResult<()> {
        match self.state {
            NetworkState::Ready => Ok(()),
            NetworkState::Faulted => Err(NanoError::Faulted),
            _ => Err(NanoError::NotInitialized),
        }
    }

    fn execute(&mut self) -> NanoResult<()> {
        let (Some(weights), Some(activations)) =
            (self.weights.as_ref(), self.activations.as_mut())
        else {
            return Err(NanoError::NotInitialized);
        };
        self.state = NetworkState::Running;
        self.has_output = false;
        match executor::run_chain(&mut self.graph, weights, activations, &self.config) {
            Ok(()) => {
                self.state = NetworkState::Ready;
                self.has_output = true;
                Ok(())
            }
            Err(err) => {
                self.state = NetworkState::Faulted;
                warn!("network '{}' faulted: {}", self.graph.name(), err);
                Err(err)
            }
        }
    }

    fn unbind(&mut self) {
        self.weights = None;
        self.activations = None;
        self.graph.unbind();
        self.state = NetworkState::Uninitialized;
        self.has_output = false;
    }
}
