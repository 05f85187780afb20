pub mod api_invariants;
pub mod recording_backend;
pub mod smoke;

pub use recording_backend::RecordingBackend;

/// Generates the shared conformance tests for a backend.
///
/// `$backend_ctor` is a closure returning `Arc<dyn ggrt::Backend>`.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::{api_invariants, smoke};

            #[test]
            fn smoke_add_matches_expected() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                smoke::add_matches_expected(&backend)
            }

            #[test]
            fn smoke_mul_mat_matches_expected() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                smoke::mul_mat_matches_expected(&backend)
            }

            #[test]
            fn smoke_soft_max_rows_sum_to_one() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                smoke::soft_max_rows_sum_to_one(&backend)
            }

            #[test]
            fn smoke_perf_counters_advance() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                smoke::perf_counters_advance(&backend)
            }

            #[test]
            fn api_measured_size_fits_real_pass() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                api_invariants::measured_size_fits_real_pass(&backend)
            }

            #[test]
            fn api_transfers_are_bounds_checked() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                api_invariants::transfers_are_bounds_checked(&backend)
            }

            #[test]
            fn api_tensor_copy_between_buffers() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                api_invariants::tensor_copy_between_buffers(&backend)
            }

            #[test]
            fn api_buffers_are_aligned() -> anyhow::Result<()> {
                let backend = ($backend_ctor)();
                api_invariants::buffers_are_aligned(&backend)
            }
        }
    };
}
