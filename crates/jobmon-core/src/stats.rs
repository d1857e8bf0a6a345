// Resource-usage summary statistics for a task template version.
//
// Memory samples are bytes, runtimes are seconds. Every statistic is null
// (None) when no samples exist; the confidence intervals additionally need
// at least two samples. Null is distinct from zero throughout.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Summary statistics over the finished task instances of one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ResourceUsageStats {
    pub num_tasks: u64,
    pub min_mem: Option<f64>,
    pub max_mem: Option<f64>,
    pub mean_mem: Option<f64>,
    pub median_mem: Option<f64>,
    pub min_runtime: Option<f64>,
    pub max_runtime: Option<f64>,
    pub mean_runtime: Option<f64>,
    pub median_runtime: Option<f64>,
    /// Two-element [low, high] about the mean, Student's t with df = n - 1
    pub ci_mem: Option<[f64; 2]>,
    pub ci_runtime: Option<[f64; 2]>,
    // Human-readable duplicates for operator tooling
    pub min_mem_human: Option<String>,
    pub max_mem_human: Option<String>,
    pub mean_mem_human: Option<String>,
    pub median_mem_human: Option<String>,
    pub min_runtime_human: Option<String>,
    pub max_runtime_human: Option<String>,
    pub mean_runtime_human: Option<String>,
    pub median_runtime_human: Option<String>,
}

impl ResourceUsageStats {
    /// Build the summary from raw samples. `mem` and `runtime` are expected
    /// to be the same length (one pair per finished task) but are summarized
    /// independently.
    pub fn from_samples(mem: &[f64], runtime: &[f64], confidence: f64) -> Self {
        let mem_summary = Summary::of(mem, confidence);
        let runtime_summary = Summary::of(runtime, confidence);

        ResourceUsageStats {
            num_tasks: mem.len().max(runtime.len()) as u64,
            min_mem: mem_summary.min,
            max_mem: mem_summary.max,
            mean_mem: mem_summary.mean,
            median_mem: mem_summary.median,
            min_runtime: runtime_summary.min,
            max_runtime: runtime_summary.max,
            mean_runtime: runtime_summary.mean,
            median_runtime: runtime_summary.median,
            ci_mem: mem_summary.ci,
            ci_runtime: runtime_summary.ci,
            min_mem_human: mem_summary.min.map(format_bytes),
            max_mem_human: mem_summary.max.map(format_bytes),
            mean_mem_human: mem_summary.mean.map(format_bytes),
            median_mem_human: mem_summary.median.map(format_bytes),
            min_runtime_human: runtime_summary.min.map(format_duration),
            max_runtime_human: runtime_summary.max.map(format_duration),
            mean_runtime_human: runtime_summary.mean.map(format_duration),
            median_runtime_human: runtime_summary.median.map(format_duration),
        }
    }

    pub fn empty() -> Self {
        Self::from_samples(&[], &[], 0.95)
    }
}

struct Summary {
    min: Option<f64>,
    max: Option<f64>,
    mean: Option<f64>,
    median: Option<f64>,
    ci: Option<[f64; 2]>,
}

impl Summary {
    fn of(samples: &[f64], confidence: f64) -> Self {
        if samples.is_empty() {
            return Summary {
                min: None,
                max: None,
                mean: None,
                median: None,
                ci: None,
            };
        }

        let n = samples.len();
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean = sorted.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        Summary {
            min: Some(sorted[0]),
            max: Some(sorted[n - 1]),
            mean: Some(mean),
            median: Some(median),
            ci: confidence_interval(&sorted, mean, confidence),
        }
    }
}

/// Confidence interval about the mean using Student's t with df = n - 1.
/// None when n < 2; [mean, mean] when the sample variance is zero.
fn confidence_interval(samples: &[f64], mean: f64, confidence: f64) -> Option<[f64; 2]> {
    let n = samples.len();
    if n < 2 {
        return None;
    }

    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    if variance == 0.0 {
        return Some([mean, mean]);
    }

    let df = n as f64 - 1.0;
    let t = StudentsT::new(0.0, 1.0, df)
        .ok()?
        .inverse_cdf(0.5 + confidence / 2.0);
    let half_width = t * (variance / n as f64).sqrt();

    Some([mean - half_width, mean + half_width])
}

/// Parse a confidence level sent as a string, e.g. "0.95". Anything that is
/// not a probability strictly between 0 and 1 falls back to 0.95.
pub fn parse_confidence(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(c) if c > 0.0 && c < 1.0 => c,
        _ => 0.95,
    }
}

/// "1.50 GiB"-style rendering of a byte count.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// "1h 2m 3s"-style rendering of a duration in seconds.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.round().max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_samples_give_all_nulls() {
        let stats = ResourceUsageStats::from_samples(&[], &[], 0.95);
        assert_eq!(stats.num_tasks, 0);
        assert_eq!(stats.min_mem, None);
        assert_eq!(stats.mean_runtime, None);
        assert_eq!(stats.ci_mem, None);
        assert_eq!(stats.mean_mem_human, None);
    }

    #[test]
    fn single_sample_has_stats_but_no_ci() {
        let stats = ResourceUsageStats::from_samples(&[1024.0], &[60.0], 0.95);
        assert_eq!(stats.num_tasks, 1);
        assert_eq!(stats.min_mem, Some(1024.0));
        assert_eq!(stats.median_mem, Some(1024.0));
        assert_eq!(stats.mean_runtime, Some(60.0));
        assert_eq!(stats.ci_mem, None);
        assert_eq!(stats.ci_runtime, None);
    }

    #[test]
    fn two_samples_have_a_ci() {
        let stats = ResourceUsageStats::from_samples(&[100.0, 200.0], &[10.0, 20.0], 0.95);
        assert_eq!(stats.num_tasks, 2);
        let [low, high] = stats.ci_mem.expect("ci present");
        assert!(low < 150.0 && 150.0 < high);
        // symmetric about the mean
        assert!((150.0 - low - (high - 150.0)).abs() < 1e-9);
    }

    #[test]
    fn zero_variance_collapses_ci_to_mean() {
        let stats = ResourceUsageStats::from_samples(&[64.0, 64.0, 64.0], &[5.0, 5.0, 5.0], 0.95);
        assert_eq!(stats.ci_mem, Some([64.0, 64.0]));
        assert_eq!(stats.ci_runtime, Some([5.0, 5.0]));
    }

    #[test]
    fn median_of_even_count_interpolates() {
        let stats =
            ResourceUsageStats::from_samples(&[1.0, 2.0, 3.0, 4.0], &[1.0, 1.0, 1.0, 1.0], 0.95);
        assert_eq!(stats.median_mem, Some(2.5));
    }

    #[test]
    fn wider_confidence_widens_the_interval() {
        let mem = [10.0, 12.0, 9.0, 14.0, 11.0];
        let narrow = ResourceUsageStats::from_samples(&mem, &mem, 0.80);
        let wide = ResourceUsageStats::from_samples(&mem, &mem, 0.99);
        let narrow_width = narrow.ci_mem.unwrap()[1] - narrow.ci_mem.unwrap()[0];
        let wide_width = wide.ci_mem.unwrap()[1] - wide.ci_mem.unwrap()[0];
        assert!(wide_width > narrow_width);
    }

    #[test]
    fn confidence_parsing_is_permissive() {
        assert_eq!(parse_confidence("0.9"), 0.9);
        assert_eq!(parse_confidence(" 0.95 "), 0.95);
        assert_eq!(parse_confidence("banana"), 0.95);
        assert_eq!(parse_confidence("1.5"), 0.95);
        assert_eq!(parse_confidence("0"), 0.95);
    }

    #[test]
    fn human_formats() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.50 KiB");
        assert_eq!(format_bytes(3.0 * 1024.0 * 1024.0 * 1024.0), "3.00 GiB");
        assert_eq!(format_duration(45.0), "45s");
        assert_eq!(format_duration(150.0), "2m 30s");
        assert_eq!(format_duration(3723.0), "1h 2m 3s");
    }
}
