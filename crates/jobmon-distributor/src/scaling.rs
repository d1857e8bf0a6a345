// Resource scaling for the retry path.
//
// When a task comes back AdjustingResources, the next attempt gets its last
// request multiplied by the task's scale factor before the rebind.

use jobmon_core::TaskResourcesSpec;

pub const DEFAULT_SCALE_FACTOR: f64 = 1.5;

/// Produce the next attempt's resource request from the previous one.
/// A missing or malformed previous request falls back to the default spec.
pub fn scale_resources(previous: Option<&serde_json::Value>, factor: f64) -> TaskResourcesSpec {
    let factor = if factor > 1.0 { factor } else { DEFAULT_SCALE_FACTOR };
    let spec: TaskResourcesSpec = previous
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    spec.scaled(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn previous_request_is_scaled() {
        let previous = json!({ "memory_bytes": 1000, "runtime_seconds": 100 });
        let next = scale_resources(Some(&previous), 2.0);
        assert_eq!(next.memory_bytes, Some(2000));
        assert_eq!(next.runtime_seconds, Some(200));
    }

    #[test]
    fn missing_request_scales_the_default() {
        let next = scale_resources(None, 2.0);
        let base = TaskResourcesSpec::default();
        assert_eq!(next.memory_bytes, base.memory_bytes.map(|m| m * 2));
    }

    #[test]
    fn degenerate_factor_falls_back() {
        let previous = json!({ "memory_bytes": 1000 });
        let next = scale_resources(Some(&previous), 0.5);
        assert_eq!(next.memory_bytes, Some(1500));
    }

    #[test]
    fn malformed_request_falls_back_to_default() {
        let previous = json!("not an object");
        let next = scale_resources(Some(&previous), 1.5);
        assert!(next.memory_bytes.is_some());
    }
}
