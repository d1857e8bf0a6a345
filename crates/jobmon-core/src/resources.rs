// Resource requests attached to task dispatch.
//
// Stored as JSONB on the server; the distributor scales them between
// attempts when a task comes back with a resource error.

use serde::{Deserialize, Serialize};

/// A concrete resource request for one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TaskResourcesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl TaskResourcesSpec {
    /// Multiply memory and runtime by `factor`, leaving cores and queue
    /// untouched. Used when rebinding an adjusting task.
    pub fn scaled(&self, factor: f64) -> TaskResourcesSpec {
        let scale_i64 = |v: i64| ((v as f64) * factor).ceil() as i64;
        TaskResourcesSpec {
            memory_bytes: self.memory_bytes.map(scale_i64),
            runtime_seconds: self.runtime_seconds.map(scale_i64),
            cores: self.cores,
            queue: self.queue.clone(),
        }
    }
}

impl Default for TaskResourcesSpec {
    fn default() -> Self {
        TaskResourcesSpec {
            memory_bytes: Some(1 << 30),
            runtime_seconds: Some(3600),
            cores: Some(1),
            queue: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_rounds_up_and_keeps_shape() {
        let spec = TaskResourcesSpec {
            memory_bytes: Some(1000),
            runtime_seconds: Some(99),
            cores: Some(4),
            queue: Some("all.q".to_string()),
        };
        let scaled = spec.scaled(1.5);
        assert_eq!(scaled.memory_bytes, Some(1500));
        assert_eq!(scaled.runtime_seconds, Some(149));
        assert_eq!(scaled.cores, Some(4));
        assert_eq!(scaled.queue.as_deref(), Some("all.q"));
    }

    #[test]
    fn scaling_skips_absent_fields() {
        let spec = TaskResourcesSpec {
            memory_bytes: None,
            runtime_seconds: Some(10),
            cores: None,
            queue: None,
        };
        let scaled = spec.scaled(2.0);
        assert_eq!(scaled.memory_bytes, None);
        assert_eq!(scaled.runtime_seconds, Some(20));
    }
}
