//! Graph side of a [`Map`]: ids, connections, validation and DOT export.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use derive_more::From;
use tracing::{debug, info};

use crate::{Map, MapError};

/// Kernel registered in a map
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelId {
    pub(crate) map: u64,
    pub(crate) index: usize,
}

impl KernelId {
    /// Refer to one of this kernel's ports by name
    pub fn port(self, name: impl Into<String>) -> PortRef {
        PortRef { kernel: self, port: name.into() }
    }

    pub fn index(self) -> usize {
        self.index
    }
}

/// Stream registered in a map
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub(crate) map: u64,
    pub(crate) index: usize,
}

impl StreamId {
    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortRef {
    pub kernel: KernelId,
    pub port: String,
}

/// One side of a connection
#[derive(Clone, Debug, PartialEq, Eq, From)]
pub enum Endpoint {
    Stream(StreamId),
    Port(PortRef),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Src {
    Stream(usize),
    Output { kernel: usize, port: usize },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Dst {
    Stream(usize),
    Input { kernel: usize, port: usize },
}

/// Connection resolved to arena indices
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Edge {
    pub src: Src,
    pub dst: Dst,
}

fn dot_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Map {
    /// Label given at registration, or `stream{index}`
    pub(crate) fn stream_name(&self, s: usize) -> String {
        match self.labels.get(s) {
            Some(Some(label)) => label.clone(),
            _ => format!("stream{s}"),
        }
    }

    fn check_kernel(&self, id: KernelId) -> Result<usize, MapError> {
        if id.map != self.id || id.index >= self.kernels.len() {
            return Err(MapError::InvalidConnection(format!("kernel #{} does not belong to this map", id.index)));
        }
        Ok(id.index)
    }

    fn check_stream(&self, id: StreamId) -> Result<usize, MapError> {
        if id.map != self.id || id.index >= self.streams.len() {
            return Err(MapError::InvalidConnection(format!("stream{} does not belong to this map", id.index)));
        }
        Ok(id.index)
    }

    /// Connect `producer` (a stream or a kernel output port) to `consumer`
    /// (a kernel input port or a stream).
    pub fn add_connection(
        &mut self,
        producer: impl Into<Endpoint>,
        consumer: impl Into<Endpoint>,
    ) -> Result<(), MapError> {
        let src = match producer.into() {
            Endpoint::Stream(id) => Src::Stream(self.check_stream(id)?),
            Endpoint::Port(PortRef { kernel, port }) => {
                let k = self.check_kernel(kernel)?;
                let kernel = &self.kernels[k];
                let p = kernel
                    .output(&port)
                    .ok_or_else(|| MapError::UnknownPort { kernel: kernel.name().into(), port })?;
                Src::Output { kernel: k, port: p.index }
            }
        };
        let dst = match consumer.into() {
            Endpoint::Stream(id) => Dst::Stream(self.check_stream(id)?),
            Endpoint::Port(PortRef { kernel, port }) => {
                let k = self.check_kernel(kernel)?;
                let kernel = &self.kernels[k];
                let p = kernel
                    .input(&port)
                    .ok_or_else(|| MapError::UnknownPort { kernel: kernel.name().into(), port })?;
                Dst::Input { kernel: k, port: p.index }
            }
        };
        if let (Src::Stream(a), Dst::Stream(b)) = (src, dst) {
            return Err(MapError::InvalidConnection(format!(
                "{} -> {}: streams can only connect to kernels",
                self.stream_name(a),
                self.stream_name(b)
            )));
        }
        self.edges.push(Edge { src, dst });
        self.invalidate();
        debug!(edge = self.edges.len() - 1, "{} -> {}", self.src_name(src), self.dst_name(dst));
        Ok(())
    }

    pub(crate) fn src_name(&self, src: Src) -> String {
        match src {
            Src::Stream(s) => self.stream_name(s),
            Src::Output { kernel, port } => {
                let k = &self.kernels[kernel];
                format!("{}.{}", k.name(), k.outputs()[port].name)
            }
        }
    }

    pub(crate) fn dst_name(&self, dst: Dst) -> String {
        match dst {
            Dst::Stream(s) => self.stream_name(s),
            Dst::Input { kernel, port } => {
                let k = &self.kernels[kernel];
                format!("{}.{}", k.name(), k.inputs()[port].name)
            }
        }
    }

    /// Edge feeding input `port` of `kernel`
    pub(crate) fn input_edge(&self, kernel: usize, port: usize) -> Option<usize> {
        self.edges.iter().position(|e| e.dst == Dst::Input { kernel, port })
    }

    /// Edge leaving output `port` of `kernel`
    pub(crate) fn output_edge(&self, kernel: usize, port: usize) -> Option<usize> {
        self.edges.iter().position(|e| e.src == Src::Output { kernel, port })
    }

    /// Edge touching stream `s`
    pub(crate) fn stream_edge(&self, s: usize) -> Option<&Edge> {
        self.edges.iter().find(|e| e.src == Src::Stream(s) || e.dst == Dst::Stream(s))
    }

    /// Every port and stream takes part in exactly one connection, and the
    /// kernels form a DAG.
    pub fn check_connections(&self) -> Result<(), MapError> {
        self.topological_order().map(|_| ())
    }

    /// Kernel indices, producers before consumers
    pub(crate) fn topological_order(&self) -> Result<Vec<usize>, MapError> {
        let incomplete = |element: String, edges: usize| Err(MapError::IncompleteGraph { element, edges });

        for (k, kernel) in self.kernels.iter().enumerate() {
            for port in kernel.inputs() {
                let n = self.edges.iter().filter(|e| e.dst == Dst::Input { kernel: k, port: port.index }).count();
                if n != 1 {
                    return incomplete(format!("{}.{}", kernel.name(), port.name), n);
                }
            }
            for port in kernel.outputs() {
                let n = self.edges.iter().filter(|e| e.src == Src::Output { kernel: k, port: port.index }).count();
                if n != 1 {
                    return incomplete(format!("{}.{}", kernel.name(), port.name), n);
                }
            }
        }
        for s in 0..self.streams.len() {
            let n = self.edges.iter().filter(|e| e.src == Src::Stream(s) || e.dst == Dst::Stream(s)).count();
            if n != 1 {
                return incomplete(self.stream_name(s), n);
            }
        }

        // Kahn, lowest index first so the order is stable
        let n = self.kernels.len();
        let mut indegree = vec![0usize; n];
        let mut succ: Vec<Vec<usize>> = vec![Vec::new(); n];
        for e in &self.edges {
            if let (Src::Output { kernel: a, .. }, Dst::Input { kernel: b, .. }) = (e.src, e.dst) {
                indegree[b] += 1;
                succ[a].push(b);
            }
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|&k| indegree[k] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(k) = ready.pop_first() {
            order.push(k);
            for &next in &succ[k] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        if let Some(k) = (0..n).find(|&k| indegree[k] > 0) {
            return Err(MapError::CycleDetected { kernel: self.kernels[k].name().into() });
        }
        Ok(order)
    }

    /// Graphviz rendering of the graph
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stream_graph {\n    rankdir=LR;\n");
        for (s, stream) in self.streams.iter().enumerate() {
            let _ = writeln!(
                out,
                "    s{s} [shape=ellipse, label=\"{}\\n{} elements, {} tiles\"];",
                dot_escape(&self.stream_name(s)),
                stream.element_count(),
                stream.tile_count()
            );
        }
        for (k, kernel) in self.kernels.iter().enumerate() {
            let _ = writeln!(out, "    k{k} [shape=box, label=\"{}\"];", dot_escape(kernel.name()));
        }
        for e in &self.edges {
            let (from, out_port) = match e.src {
                Src::Stream(s) => (format!("s{s}"), None),
                Src::Output { kernel, port } => (format!("k{kernel}"), Some(&self.kernels[kernel].outputs()[port].name)),
            };
            let (to, in_port) = match e.dst {
                Dst::Stream(s) => (format!("s{s}"), None),
                Dst::Input { kernel, port } => (format!("k{kernel}"), Some(&self.kernels[kernel].inputs()[port].name)),
            };
            let label = match (out_port, in_port) {
                (Some(o), Some(i)) => format!("{o} -> {i}"),
                (Some(p), None) | (None, Some(p)) => p.clone(),
                (None, None) => String::new(),
            };
            let _ = writeln!(out, "    {from} -> {to} [label=\"{}\"];", dot_escape(&label));
        }
        out.push_str("}\n");
        out
    }

    /// Write [`Map::to_dot`] to `path`
    pub fn export_dot(&self, path: impl AsRef<Path>) -> Result<(), MapError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_dot()).map_err(|source| MapError::Io { path: path.to_path_buf(), source })?;
        info!(path = %path.display(), "graph exported");
        Ok(())
    }
}
