use std::env;
use std::sync::OnceLock;

use crate::graph::DEFAULT_GRAPH_SIZE;

static GGRT_GRAPH_SIZE: OnceLock<usize> = OnceLock::new();
static GGRT_SCHED_DEBUG: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_size(value: &str) -> Option<usize> {
    value.trim().parse().ok().filter(|&size| size > 0)
}

pub(crate) fn default_graph_size() -> usize {
    *GGRT_GRAPH_SIZE.get_or_init(|| match env::var("GGRT_GRAPH_SIZE") {
        Ok(value) => parse_size(&value).unwrap_or_else(|| {
            tracing::warn!(%value, "ignoring invalid GGRT_GRAPH_SIZE");
            DEFAULT_GRAPH_SIZE
        }),
        Err(_) => DEFAULT_GRAPH_SIZE,
    })
}

pub(crate) fn sched_debug_enabled() -> bool {
    *GGRT_SCHED_DEBUG.get_or_init(|| match env::var("GGRT_SCHED_DEBUG") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_flags_accept_common_spellings() {
        for on in ["1", "true", " YES ", "On"] {
            assert!(parse_bool(on), "{on}");
        }
        for off in ["0", "false", "no", "maybe"] {
            assert!(!parse_bool(off), "{off}");
        }
    }

    #[test]
    fn sizes_must_be_positive_integers() {
        assert_eq!(parse_size(" 4096 "), Some(4096));
        assert_eq!(parse_size("0"), None);
        assert_eq!(parse_size("big"), None);
    }
}
