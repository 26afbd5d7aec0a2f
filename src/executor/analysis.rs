//! Analysis stage executor
//!
//! Samples the configured metrics and HTTP checks on every tick for the
//! configured duration. Each item tolerates `failure_limit` consecutive
//! bad samples before failing the stage; sampling state lives in the
//! stage metadata so it survives executor ticks.

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::{Executor, ExecutorInput, StageResult, StopSignal};
use crate::config::{AnalysisHttp, AnalysisMetrics, AnalysisStageOptions, StageOptions};

pub struct AnalysisExecutor {
    client: reqwest::Client,
}

impl AnalysisExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn options(input: &ExecutorInput) -> Option<AnalysisStageOptions> {
        match input.stage_config.as_ref().map(|c| &c.options) {
            Some(StageOptions::Analysis(opts)) => Some(opts.clone()),
            _ => None,
        }
    }

    async fn sample_metric(&self, metric: &AnalysisMetrics) -> Result<bool, String> {
        if metric.provider.is_empty() {
            // No provider endpoint configured; nothing to evaluate.
            return Ok(true);
        }
        let url = format!("{}?query={}", metric.provider, metric.query);
        let response = self
            .client
            .get(&url)
            .timeout(metric.timeout.as_duration())
            .send()
            .await
            .map_err(|e| format!("query failed: {}", e))?;
        let body = response
            .text()
            .await
            .map_err(|e| format!("query failed: {}", e))?;
        let value: f64 = body
            .trim()
            .parse()
            .map_err(|_| format!("non-numeric sample: {}", body.trim()))?;
        Ok(check_expected(&metric.expected, value))
    }

    async fn sample_http(&self, http: &AnalysisHttp) -> Result<bool, String> {
        let method = if http.method.is_empty() {
            "GET"
        } else {
            http.method.as_str()
        };
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| format!("invalid method: {}", method))?;
        let response = self
            .client
            .request(method, &http.url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        let expected = if http.expected_code == 0 {
            200
        } else {
            http.expected_code
        };
        Ok(response.status().as_u16() == expected)
    }

    /// Bump or reset the consecutive-failure counter kept in metadata.
    /// Returns the count after this sample.
    async fn record_sample(
        input: &ExecutorInput,
        item_key: &str,
        good: bool,
    ) -> u32 {
        let counter_key = format!("analysis-failures-{}", item_key);
        let count = if good {
            0
        } else {
            input
                .metadata
                .get_stage(&input.stage.id, &counter_key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
                + 1
        };
        if let Err(e) = input
            .metadata
            .set_stage(&input.stage.id, &counter_key, &count.to_string())
            .await
        {
            warn!("Failed to persist analysis counter: {}", e);
        }
        count
    }
}

impl Default for AnalysisExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for AnalysisExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageResult {
        if sig.signal().is_cancel() {
            return StageResult::Cancelled;
        }

        let Some(options) = Self::options(input) else {
            return StageResult::Failure(
                "missing analysis options in the stage configuration".to_string(),
            );
        };

        let elapsed = Utc::now().signed_duration_since(input.stage.created_at);
        let duration = chrono::Duration::from_std(options.duration.as_duration())
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        if elapsed > duration {
            input.log.success("Analysis completed without exceeding any failure limit");
            return StageResult::Success;
        }

        for (i, metric) in options.metrics.iter().enumerate() {
            let item = format!("metric-{}", i);
            match self.sample_metric(metric).await {
                Ok(good) => {
                    let failures = Self::record_sample(input, &item, good).await;
                    if !good {
                        input.log.error(format!(
                            "Metric {} is out of the expected range ({}/{})",
                            metric.query, failures, metric.failure_limit
                        ));
                        if failures >= metric.failure_limit {
                            return StageResult::Failure(format!(
                                "analysis failed: metric {} exceeded its failure limit",
                                metric.query
                            ));
                        }
                    }
                }
                Err(e) => {
                    let failures = Self::record_sample(input, &item, false).await;
                    input.log.error(format!(
                        "Failed to sample metric {}: {} ({}/{})",
                        metric.query, e, failures, metric.failure_limit
                    ));
                    if failures >= metric.failure_limit {
                        return StageResult::Failure(format!(
                            "analysis failed: metric {} could not be sampled",
                            metric.query
                        ));
                    }
                }
            }
        }

        for (i, http) in options.https.iter().enumerate() {
            let item = format!("http-{}", i);
            let good = self.sample_http(http).await.unwrap_or(false);
            let failures = Self::record_sample(input, &item, good).await;
            if !good {
                input.log.error(format!(
                    "HTTP check {} failed ({}/{})",
                    http.url, failures, http.failure_limit
                ));
                if failures >= http.failure_limit {
                    return StageResult::Failure(format!(
                        "analysis failed: http check {} exceeded its failure limit",
                        http.url
                    ));
                }
            }
        }

        StageResult::Exited
    }
}

/// Evaluate an expected-range expression such as `< 0.05`, `>= 10`,
/// `0.1-0.5` or a bare number meaning equality.
pub fn check_expected(expected: &str, value: f64) -> bool {
    let expected = expected.trim();
    if expected.is_empty() {
        return true;
    }
    if let Some(rest) = expected.strip_prefix("<=") {
        return rest.trim().parse::<f64>().map(|x| value <= x).unwrap_or(false);
    }
    if let Some(rest) = expected.strip_prefix(">=") {
        return rest.trim().parse::<f64>().map(|x| value >= x).unwrap_or(false);
    }
    if let Some(rest) = expected.strip_prefix('<') {
        return rest.trim().parse::<f64>().map(|x| value < x).unwrap_or(false);
    }
    if let Some(rest) = expected.strip_prefix('>') {
        return rest.trim().parse::<f64>().map(|x| value > x).unwrap_or(false);
    }
    if let Some((low, high)) = expected.split_once('-') {
        if let (Ok(low), Ok(high)) = (low.trim().parse::<f64>(), high.trim().parse::<f64>()) {
            return value >= low && value <= high;
        }
    }
    expected.parse::<f64>().map(|x| value == x).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_expected() {
        assert!(check_expected("< 0.05", 0.01));
        assert!(!check_expected("< 0.05", 0.1));
        assert!(check_expected(">= 10", 10.0));
        assert!(check_expected("0.1-0.5", 0.3));
        assert!(!check_expected("0.1-0.5", 0.6));
        assert!(check_expected("5", 5.0));
        assert!(check_expected("", 123.0));
    }
}
