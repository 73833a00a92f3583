// Persist — Save and load graphs
//
// Binary graph format (.jcg), all integers little-endian:
//
//   Header:
//     magic:   [u8; 4]  = b"JCBG"
//     version: u32      = 1
//
//   Flow nodes, then data nodes:
//     count:   u32
//     per node:
//       id:        u32
//       ndim:      u32
//       dims:      [u32; ndim]
//       producer:  u8 (0 = none, 1 = present), then u32 id if present
//       consumers: u32 count, then [u32; count]
//
//   Op nodes:
//     count:   u32
//     per op:
//       id:      u32
//       kind:    u8   (OpKind tag)
//       arg:     i32
//       inputs:  u32 count, then [u32; count]
//       output:  u32
//
//   Partitions, in order inputs, outputs, internal, data:
//     count: u32, then [u32; count]
//
// Loading rebuilds the graph through Graph::from_parts, so a file that
// decodes but breaks a structural invariant is rejected as well.
//
// Usage:
//   persist::save("model.jcg", &graph)?;
//   let graph = persist::load("model.jcg")?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use jacobi_core::{Error, Graph, GraphParts, NodeId, OpKind, OpNode, Operation, Result, Shape, TensorNode};

// Constants

const MAGIC: &[u8; 4] = b"JCBG";
const VERSION: u32 = 1;

// Low-level helpers

fn write_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_i32(w: &mut impl Write, v: i32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::msg(format!("length {len} does not fit the graph format")))
}

fn write_ids(w: &mut impl Write, ids: &[NodeId]) -> Result<()> {
    write_u32(w, len_u32(ids.len())?)?;
    for id in ids {
        write_u32(w, id.0)?;
    }
    Ok(())
}

fn read_ids(r: &mut impl Read) -> Result<Vec<NodeId>> {
    let count = read_u32(r)? as usize;
    let mut ids = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ids.push(NodeId(read_u32(r)?));
    }
    Ok(ids)
}

fn write_tensor_node(w: &mut impl Write, node: &TensorNode) -> Result<()> {
    write_u32(w, node.id.0)?;
    let dims = node.shape.dims();
    write_u32(w, len_u32(dims.len())?)?;
    for &d in dims {
        write_u32(w, len_u32(d)?)?;
    }
    match node.producer {
        Some(p) => {
            write_u8(w, 1)?;
            write_u32(w, p.0)?;
        }
        None => write_u8(w, 0)?,
    }
    write_ids(w, &node.consumers)
}

fn read_tensor_node(r: &mut impl Read) -> Result<TensorNode> {
    let id = NodeId(read_u32(r)?);
    let ndim = read_u32(r)? as usize;
    let mut dims = Vec::with_capacity(ndim.min(16));
    for _ in 0..ndim {
        dims.push(read_u32(r)? as usize);
    }
    let producer = match read_u8(r)? {
        0 => None,
        1 => Some(NodeId(read_u32(r)?)),
        flag => return Err(Error::msg(format!("invalid producer flag {flag} on node {id}"))),
    };
    let consumers = read_ids(r)?;
    Ok(TensorNode {
        id,
        shape: Shape::new(dims),
        producer,
        consumers,
    })
}

fn write_op_node(w: &mut impl Write, op: &OpNode) -> Result<()> {
    write_u32(w, op.id.0)?;
    write_u8(w, op.op.kind.tag())?;
    write_i32(w, op.op.arg)?;
    write_ids(w, &op.inputs)?;
    write_u32(w, op.output.0)?;
    Ok(())
}

fn read_op_node(r: &mut impl Read) -> Result<OpNode> {
    let id = NodeId(read_u32(r)?);
    let tag = read_u8(r)?;
    let kind = OpKind::from_tag(tag).ok_or_else(|| Error::msg(format!("unknown op tag {tag} on node {id}")))?;
    let arg = read_i32(r)?;
    let inputs = read_ids(r)?;
    let output = NodeId(read_u32(r)?);
    Ok(OpNode {
        id,
        op: Operation::new(kind, arg),
        inputs,
        output,
    })
}

fn read_list<R: Read, T>(r: &mut R, f: impl Fn(&mut R) -> Result<T>) -> Result<Vec<T>> {
    let count = read_u32(r)? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(f(r)?);
    }
    Ok(items)
}

// Public API

/// Encode a graph to a writer.
pub fn write_graph(writer: &mut impl Write, graph: &Graph) -> Result<()> {
    write_parts(writer, &graph.to_parts())
}

/// Encode raw graph tables. Nothing is validated until they are read back.
pub fn write_parts(writer: &mut impl Write, parts: &GraphParts) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;

    for nodes in [&parts.flow_nodes, &parts.data_nodes] {
        write_u32(writer, len_u32(nodes.len())?)?;
        for node in nodes {
            write_tensor_node(writer, node)?;
        }
    }
    write_u32(writer, len_u32(parts.op_nodes.len())?)?;
    for op in &parts.op_nodes {
        write_op_node(writer, op)?;
    }
    for ids in [&parts.inputs, &parts.outputs, &parts.internal, &parts.data] {
        write_ids(writer, ids)?;
    }
    Ok(())
}

/// Decode a graph from a reader.
pub fn read_graph(reader: &mut impl Read) -> Result<Graph> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "invalid graph file: expected magic {:?}, got {:?}",
            MAGIC, magic
        )));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "unsupported graph file version: {} (expected {})",
            version, VERSION
        )));
    }

    let flow_nodes = read_list(reader, |r| read_tensor_node(r))?;
    let data_nodes = read_list(reader, |r| read_tensor_node(r))?;
    let op_nodes = read_list(reader, |r| read_op_node(r))?;
    let inputs = read_ids(reader)?;
    let outputs = read_ids(reader)?;
    let internal = read_ids(reader)?;
    let data = read_ids(reader)?;

    Graph::from_parts(GraphParts {
        flow_nodes,
        data_nodes,
        op_nodes,
        inputs,
        outputs,
        internal,
        data,
    })
}

/// Encode a graph into a byte vector.
pub fn to_bytes(graph: &Graph) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_graph(&mut buf, graph)?;
    Ok(buf)
}

/// Decode a graph from bytes. Trailing bytes are an error.
pub fn from_bytes(bytes: &[u8]) -> Result<Graph> {
    let mut cursor = bytes;
    let graph = read_graph(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(Error::msg(format!(
            "{} trailing bytes after graph",
            cursor.len()
        )));
    }
    Ok(graph)
}

/// Save a graph to a file.
pub fn save(path: impl AsRef<Path>, graph: &Graph) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_graph(&mut writer, graph)?;
    writer.flush()?;
    log::debug!("saved graph to {}", path.as_ref().display());
    Ok(())
}

/// Load a graph from a file.
pub fn load(path: impl AsRef<Path>) -> Result<Graph> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_graph(&mut reader)
}
