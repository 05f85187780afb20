//! Reference CPU backend for ggrt.

pub mod cpu;
mod kernels;

use std::sync::Arc;

use ggrt::backend::registry::register_backend;
use ggrt::Backend;

pub use cpu::{CpuBackend, CpuBufferType};

/// Register the CPU backend with the global backend registry under `"cpu"`.
pub fn register_cpu_backend() {
    register_backend("cpu", || Arc::new(CpuBackend::new()) as Arc<dyn Backend>);
}
