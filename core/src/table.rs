//! Binary graph table: a compiled graph as little-endian bytes.
//!
//! ```text
//! header   "NANO" u16 version  u32 signature  u32 weights_size  u32 activations_size
//!          u16 tensor_count  u16 node_count  u16 input  u16 output
//! tensor   u8 format  u8 arena  u32 shape[4]  u32 strides[4]  u32 offset  u32 len
//! node     u8 kind  u32 params[18]
//!          u8 n  u16 inputs[n]   u8 n  u16 weights[n]   u8 n  u16 scratch[n]
//!          u16 output
//! ```
//!
//! Nodes are stored in chain order; decoding relinks them in that order and
//! then runs the same validation as the builder, so a table can't smuggle
//! in a layout the builder would have rejected.

use crate::arena::Handle;
use crate::error::{NanoError, NanoResult};
use crate::graph::{Graph, MAX_NODES, MAX_TENSORS};
use crate::layers::{
    Activation, Conv2d, Dense, LayerKind, LayerNode, Nonlinearity, Pool2d, PoolGeometry, PoolKind,
    TensorList, MAX_NODE_TENSORS,
};
use crate::tensor::{ArenaKind, DataBuffer, Format, Shape, Strides, TensorDescriptor, TensorId};

pub const TABLE_MAGIC: [u8; 4] = *b"NANO";
pub const TABLE_VERSION: u16 = 1;

/// Parameter slots per node record.
pub const PARAM_SLOTS: usize = 18;

const HEADER_LEN: usize = 4 + 2 + 4 + 4 + 4 + 2 + 2 + 2 + 2;
const TENSOR_RECORD_LEN: usize = 1 + 1 + 4 * 4 + 4 * 4 + 4 + 4;

const KIND_CONV2D: u8 = 1;
const KIND_POOL: u8 = 2;
const KIND_DENSE: u8 = 3;
const KIND_NONLINEARITY: u8 = 4;

struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, value: u8) {
        self.bytes(&[value]);
    }

    fn u16(&mut self, value: u16) {
        self.bytes(&value.to_le_bytes());
    }

    fn u32(&mut self, value: usize) -> NanoResult<()> {
        let value = u32::try_from(value)
            .map_err(|_| NanoError::InvalidTable("value does not fit in u32"))?;
        self.bytes(&value.to_le_bytes());
        Ok(())
    }

    fn list(&mut self, list: &TensorList) {
        self.u8(list.len() as u8);
        for id in list.as_slice() {
            self.u16(id.0);
        }
    }
}

struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, len: usize) -> NanoResult<&'b [u8]> {
        let end = self.pos + len;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(NanoError::InvalidTable("truncated table"))?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> NanoResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> NanoResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> NanoResult<usize> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn tensor_id(&mut self, count: usize) -> NanoResult<TensorId> {
        let id = self.u16()?;
        if id as usize >= count {
            return Err(NanoError::InvalidTable("tensor id out of range"));
        }
        Ok(TensorId(id))
    }

    fn list(&mut self, count: usize) -> NanoResult<TensorList> {
        let len = self.u8()? as usize;
        if len > MAX_NODE_TENSORS {
            return Err(NanoError::InvalidTable("too many tensors in a node role"));
        }
        let mut list = TensorList::new();
        for _ in 0..len {
            list.push(self.tensor_id(count)?)?;
        }
        Ok(list)
    }
}

fn pool_tag(pool: Option<&PoolGeometry>) -> usize {
    match pool.map(|p| p.kind) {
        None => 0,
        Some(PoolKind::Max) => 1,
        Some(PoolKind::Avg) => 2,
    }
}

fn pool_from(tag: usize, slots: &[usize]) -> NanoResult<Option<PoolGeometry>> {
    let kind = match tag {
        0 => return Ok(None),
        1 => PoolKind::Max,
        2 => PoolKind::Avg,
        _ => return Err(NanoError::InvalidTable("unknown pool kind")),
    };
    Ok(Some(
        PoolGeometry::new(kind, (slots[0], slots[1]), (slots[2], slots[3]))
            .with_padding((slots[4], slots[5])),
    ))
}

fn pool_slots(pool: &PoolGeometry, out: &mut [usize]) {
    out[..6].copy_from_slice(&[
        pool.size.0,
        pool.size.1,
        pool.stride.0,
        pool.stride.1,
        pool.pad.0,
        pool.pad.1,
    ]);
}

fn encode_layer(layer: &LayerKind) -> (u8, [usize; PARAM_SLOTS]) {
    let mut p = [0usize; PARAM_SLOTS];
    let tag = match layer {
        LayerKind::Conv2d(c) => {
            p[..11].copy_from_slice(&[
                c.out_channels,
                c.kernel.0,
                c.kernel.1,
                c.stride.0,
                c.stride.1,
                c.dilation.0,
                c.dilation.1,
                c.padding.0,
                c.padding.1,
                c.groups,
                match c.activation {
                    Activation::Identity => 0,
                    Activation::Relu => 1,
                },
            ]);
            p[11] = pool_tag(c.pool.as_ref());
            if let Some(pool) = &c.pool {
                pool_slots(pool, &mut p[12..]);
            }
            KIND_CONV2D
        }
        LayerKind::Pool(pool) => {
            p[0] = pool_tag(Some(&pool.geometry));
            pool_slots(&pool.geometry, &mut p[1..]);
            KIND_POOL
        }
        LayerKind::Dense(d) => {
            p[0] = d.out_features;
            KIND_DENSE
        }
        LayerKind::Nonlinearity(n) => {
            p[0] = match n {
                Nonlinearity::Softmax => 0,
                Nonlinearity::Relu => 1,
            };
            KIND_NONLINEARITY
        }
    };
    (tag, p)
}

fn decode_layer(tag: u8, p: &[usize; PARAM_SLOTS]) -> NanoResult<LayerKind> {
    match tag {
        KIND_CONV2D => {
            let activation = match p[10] {
                0 => Activation::Identity,
                1 => Activation::Relu,
                _ => return Err(NanoError::InvalidTable("unknown activation")),
            };
            let mut conv = Conv2d::new(p[0], (p[1], p[2]))
                .with_stride((p[3], p[4]))
                .with_dilation((p[5], p[6]))
                .with_padding((p[7], p[8]))
                .with_groups(p[9])
                .with_activation(activation);
            conv.pool = pool_from(p[11], &p[12..])?;
            Ok(LayerKind::Conv2d(conv))
        }
        KIND_POOL => {
            let geometry = pool_from(p[0], &p[1..])?
                .ok_or(NanoError::InvalidTable("pool node without a pool kind"))?;
            Ok(LayerKind::Pool(Pool2d::new(geometry)))
        }
        KIND_DENSE => Ok(LayerKind::Dense(Dense::new(p[0]))),
        KIND_NONLINEARITY => match p[0] {
            0 => Ok(LayerKind::Nonlinearity(Nonlinearity::Softmax)),
            1 => Ok(LayerKind::Nonlinearity(Nonlinearity::Relu)),
            _ => Err(NanoError::InvalidTable("unknown nonlinearity")),
        },
        _ => Err(NanoError::InvalidTable("unknown layer kind")),
    }
}

impl Graph {
    /// Exact size of the encoded table.
    pub fn table_len(&self) -> usize {
        let nodes: usize = self
            .nodes()
            .map(|(_, n)| {
                let refs = n.inputs.len() + n.weights.len() + n.scratch.len();
                1 + 4 * PARAM_SLOTS + 3 + 2 * refs + 2
            })
            .sum();
        HEADER_LEN + self.tensor_count * TENSOR_RECORD_LEN + nodes
    }

    /// Encode into `out`; returns the bytes written.
    pub fn write_table(&self, out: &mut [u8]) -> NanoResult<usize> {
        let required = self.table_len();
        if out.len() < required {
            return Err(NanoError::BufferTooSmall {
                required,
                available: out.len(),
            });
        }
        let mut w = Writer { buf: out, pos: 0 };

        w.bytes(&TABLE_MAGIC);
        w.u16(TABLE_VERSION);
        w.u32(self.signature as usize)?;
        w.u32(self.weights_size)?;
        w.u32(self.activations_size)?;
        w.u16(self.tensor_count as u16);
        w.u16(self.node_count as u16);
        w.u16(self.input.0);
        w.u16(self.output.0);

        for t in self.tensors() {
            w.u8(t.format.tag());
            w.u8(t.buffer.arena.tag());
            for dim in t.shape.dims() {
                w.u32(dim)?;
            }
            for stride in t.strides.0 {
                w.u32(stride)?;
            }
            w.u32(t.buffer.handle.offset())?;
            w.u32(t.buffer.handle.len())?;
        }

        for (_, node) in self.nodes() {
            let (tag, params) = encode_layer(&node.layer);
            w.u8(tag);
            for value in params {
                w.u32(value)?;
            }
            w.list(&node.inputs);
            w.list(&node.weights);
            w.list(&node.scratch);
            w.u16(node.output.0);
        }
        Ok(w.pos)
    }

    /// Decode and fully validate a table.
    pub fn from_table(bytes: &[u8], name: &'static str) -> NanoResult<Graph> {
        let mut r = Reader { buf: bytes, pos: 0 };
        if r.take(4)? != &TABLE_MAGIC[..] {
            return Err(NanoError::InvalidTable("bad magic"));
        }
        if r.u16()? != TABLE_VERSION {
            return Err(NanoError::InvalidTable("unsupported version"));
        }
        let signature = r.u32()? as u32;
        let mut graph = Graph::empty(name, signature);
        graph.weights_size = r.u32()?;
        graph.activations_size = r.u32()?;
        let tensor_count = r.u16()? as usize;
        let node_count = r.u16()? as usize;
        if tensor_count > MAX_TENSORS {
            return Err(NanoError::CapacityExceeded {
                what: "tensors",
                limit: MAX_TENSORS,
            });
        }
        if node_count > MAX_NODES {
            return Err(NanoError::CapacityExceeded {
                what: "nodes",
                limit: MAX_NODES,
            });
        }
        graph.input = r.tensor_id(tensor_count)?;
        graph.output = r.tensor_id(tensor_count)?;

        for _ in 0..tensor_count {
            let format = Format::from_tag(r.u8()?)
                .ok_or(NanoError::InvalidTable("unknown tensor format"))?;
            let arena =
                ArenaKind::from_tag(r.u8()?).ok_or(NanoError::InvalidTable("unknown arena"))?;
            let mut dims = [0usize; 4];
            for dim in dims.iter_mut() {
                *dim = r.u32()?;
            }
            let mut strides = [0usize; 4];
            for stride in strides.iter_mut() {
                *stride = r.u32()?;
            }
            let offset = r.u32()?;
            let len = r.u32()?;
            let shape = Shape::from_dims(dims);
            let handle = Handle::new(offset, len);
            let size = shape
                .checked_element_count()
                .and_then(|count| format.checked_byte_size(count));
            if size.is_none() || handle.checked_end().is_none() {
                return Err(NanoError::InvalidTable("tensor size overflows"));
            }
            graph.push_tensor(TensorDescriptor {
                format,
                shape,
                strides: Strides(strides),
                buffer: DataBuffer::new(arena, handle),
            })?;
        }

        for _ in 0..node_count {
            let tag = r.u8()?;
            let mut params = [0usize; PARAM_SLOTS];
            for slot in params.iter_mut() {
                *slot = r.u32()?;
            }
            let layer = decode_layer(tag, &params)?;
            let inputs = r.list(tensor_count)?;
            let weights = r.list(tensor_count)?;
            let scratch = r.list(tensor_count)?;
            let output = r.tensor_id(tensor_count)?;
            graph.push_node(LayerNode::new(layer, inputs, output, weights, scratch))?;
        }
        if r.pos != bytes.len() {
            return Err(NanoError::InvalidTable("trailing bytes"));
        }

        graph.link_in_order();
        graph.validate()?;
        Ok(graph)
    }
}
