//! Collects the per-tensor perf counters of a graph into a report.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::context::{Context, ContextError};
use crate::graph::Graph;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodePerf {
    pub name: String,
    pub op: &'static str,
    pub ne: [usize; 4],
    pub runs: u64,
    pub cycles: u64,
    pub time_us: u64,
}

impl NodePerf {
    pub fn avg_time_us(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.time_us as f64 / self.runs as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphPerfReport {
    pub nodes: Vec<NodePerf>,
    pub total_cycles: u64,
    pub total_time_us: u64,
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl GraphPerfReport {
    pub fn collect(ctx: &Context, graph: &Graph) -> Result<Self, ContextError> {
        let mut report = GraphPerfReport::default();
        for &id in graph.nodes() {
            let header = ctx.tensor(id)?;
            let perf = header.perf();
            report.total_cycles += perf.cycles;
            report.total_time_us += micros(perf.time);
            report.nodes.push(NodePerf {
                name: header.label(),
                op: header.op().name(),
                ne: header.ne(),
                runs: perf.runs,
                cycles: perf.cycles,
                time_us: micros(perf.time),
            });
        }
        Ok(report)
    }

    /// The `n` nodes with the most accumulated time, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<&NodePerf> {
        let mut nodes: Vec<&NodePerf> = self.nodes.iter().collect();
        nodes.sort_by(|a, b| b.cycles.cmp(&a.cycles));
        nodes.truncate(n);
        nodes
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for GraphPerfReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== graph perf: {} nodes ===", self.nodes.len())?;
        for (i, node) in self.nodes.iter().enumerate() {
            writeln!(
                f,
                " - {i:3}: [{:5}, {:5}, {:5}] {:>16} {:>24} runs={:4} cycles={:10} avg={:10.3} us",
                node.ne[0],
                node.ne[1],
                node.ne[2],
                node.op,
                node.name,
                node.runs,
                node.cycles,
                node.avg_time_us()
            )?;
        }
        write!(
            f,
            "total: cycles={} time={} us",
            self.total_cycles, self.total_time_us
        )
    }
}
