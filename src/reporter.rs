//! Run reporting to the backend API.
//!
//! After a run the metrics summary is transformed into the generation-runs
//! payload and POSTed to the backend. Reporting is strictly best-effort:
//! every transport failure is logged and swallowed so a dead backend can
//! never fail an otherwise healthy pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::pipeline::exit_codes;
use crate::prelude::*;
use crate::type_mapping::{normalize_difficulty_metrics, normalize_type_metrics};

/// Context fields attached to a run report.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub environment: Option<String>,
    pub triggered_by: Option<String>,
    pub prompt_version: Option<String>,
    pub arbiter_config_version: Option<String>,
    pub min_arbiter_score_threshold: Option<f64>,
}

/// Reports run metrics to the backend API.
#[derive(Debug)]
pub struct RunReporter {
    backend_url: String,
    service_key: String,
    client: reqwest::Client,
}

impl RunReporter {
    pub fn new(backend_url: &str, service_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            backend_url: backend_url.trim_end_matches('/').to_owned(),
            service_key: service_key.to_owned(),
            client,
        }
    }

    /// Report a completed run. Returns the created run id, or `None` when
    /// reporting failed for any reason.
    pub async fn report_run(
        &self,
        summary: &Value,
        exit_code: i32,
        context: &ReportContext,
    ) -> Option<i64> {
        let payload = build_payload(summary, exit_code, context);
        self.post_payload(&payload, "run").await
    }

    /// Report the start of a run with a minimal "running" record so stuck
    /// or crashed jobs can be detected from the backend.
    pub async fn report_running(
        &self,
        started_at: DateTime<Utc>,
        questions_requested: u64,
        context: &ReportContext,
    ) -> Option<i64> {
        let payload = json!({
            "started_at": started_at.to_rfc3339(),
            "status": "running",
            "questions_requested": questions_requested,
            "environment": &context.environment,
            "triggered_by": &context.triggered_by,
        });
        self.post_payload(&payload, "run start").await
    }

    async fn post_payload(&self, payload: &Value, what: &str) -> Option<i64> {
        let url = format!("{}/v1/admin/generation-runs", self.backend_url);
        info!(%url, "reporting {what}");

        let response = match self
            .client
            .post(&url)
            .header("X-Service-Key", &self.service_key)
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "failed to report {what}");
                return None;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body, "failed to report {what}");
            return None;
        }
        match response.json::<Value>().await {
            Ok(body) => {
                let run_id = body.get("id").and_then(Value::as_i64);
                info!(?run_id, "{what} reported");
                run_id
            }
            Err(err) => {
                error!(%err, "failed to parse {what} report response");
                None
            }
        }
    }
}

/// Transform the metrics summary into the generation-runs payload.
pub fn build_payload(summary: &Value, exit_code: i32, context: &ReportContext) -> Value {
    let execution = &summary["execution"];
    let generation = &summary["generation"];
    let evaluation = &summary["evaluation"];
    let deduplication = &summary["deduplication"];
    let database = &summary["database"];
    let api = &summary["api"];
    let errors = &summary["error_classification"];
    let overall = &summary["overall"];

    let provider_metrics = build_provider_metrics(generation, api);
    let type_metrics = normalize_type_metrics(&count_map(&generation["by_type"]));
    let difficulty_metrics =
        normalize_difficulty_metrics(&count_map(&generation["by_difficulty"]));

    let error_summary = json!({
        "by_category": errors["by_category"],
        "by_severity": errors["by_severity"],
        "critical_count": errors["critical_errors"],
    });
    let has_errors = errors["by_category"].as_object().is_some_and(|m| !m.is_empty())
        || errors["critical_errors"].as_u64().unwrap_or(0) > 0;

    json!({
        "started_at": execution["start_time"],
        "completed_at": execution["end_time"],
        "duration_seconds": execution["duration_seconds"],
        "status": determine_status(exit_code, overall),
        "exit_code": exit_code,
        "questions_requested": generation["requested"],
        "questions_generated": generation["generated"],
        "generation_failures": generation["failed"],
        "generation_success_rate": generation["success_rate"],
        "questions_evaluated": evaluation["evaluated"],
        "questions_approved": evaluation["approved"],
        "questions_rejected": evaluation["rejected"],
        "approval_rate": evaluation["approval_rate"],
        "avg_arbiter_score": evaluation["average_score"],
        "min_arbiter_score": evaluation["min_score"],
        "max_arbiter_score": evaluation["max_score"],
        "duplicates_found": deduplication["duplicates_found"],
        "exact_duplicates": deduplication["exact_duplicates"],
        "semantic_duplicates": deduplication["semantic_duplicates"],
        "duplicate_rate": deduplication["duplicate_rate"],
        "questions_inserted": database["inserted"],
        "insertion_failures": database["failed"],
        "overall_success_rate": overall["overall_success_rate"],
        "total_errors": overall["total_errors"],
        "total_api_calls": api["total_calls"],
        "provider_metrics": if provider_metrics.as_object().is_some_and(|m| !m.is_empty()) {
            provider_metrics
        } else {
            Value::Null
        },
        "type_metrics": if type_metrics.is_empty() { Value::Null } else { json!(type_metrics) },
        "difficulty_metrics": if difficulty_metrics.is_empty() {
            Value::Null
        } else {
            json!(difficulty_metrics)
        },
        "error_summary": if has_errors { error_summary } else { Value::Null },
        "prompt_version": &context.prompt_version,
        "arbiter_config_version": &context.arbiter_config_version,
        "min_arbiter_score_threshold": context.min_arbiter_score_threshold,
        "environment": &context.environment,
        "triggered_by": &context.triggered_by,
    })
}

/// Status derivation from the exit code. Unknown codes fall back to
/// comparing inserted against requested.
fn determine_status(exit_code: i32, overall: &Value) -> &'static str {
    match exit_code {
        exit_codes::SUCCESS => "success",
        exit_codes::PARTIAL_FAILURE => "partial_failure",
        exit_codes::CONFIG_ERROR
        | exit_codes::NO_QUESTIONS
        | exit_codes::DATABASE_ERROR
        | exit_codes::UNKNOWN_ERROR
        | exit_codes::PIPELINE_ERROR => "failed",
        _ => {
            let inserted = overall["questions_final_output"].as_u64().unwrap_or(0);
            let requested = overall["questions_requested"].as_u64().unwrap_or(0);
            if inserted == 0 {
                "failed"
            } else if inserted < requested {
                "partial_failure"
            } else {
                "success"
            }
        }
    }
}

fn build_provider_metrics(generation: &Value, api: &Value) -> Value {
    let generated = count_map(&generation["by_provider"]);
    let api_calls = count_map(&api["by_provider"]);

    let mut providers: Vec<&String> = generated.keys().chain(api_calls.keys()).collect();
    providers.sort();
    providers.dedup();

    let mut metrics = serde_json::Map::new();
    for provider in providers {
        metrics.insert(
            provider.clone(),
            json!({
                "generated": generated.get(provider).copied().unwrap_or(0),
                "api_calls": api_calls.get(provider).copied().unwrap_or(0),
                "failures": 0,
            }),
        );
    }
    Value::Object(metrics)
}

fn count_map(value: &Value) -> BTreeMap<String, u64> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.as_u64().unwrap_or(0)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> Value {
        json!({
            "execution": {
                "start_time": "2026-08-01T00:00:00+00:00",
                "end_time": "2026-08-01T00:05:00+00:00",
                "duration_seconds": 300.0,
            },
            "generation": {
                "requested": 10, "generated": 8, "failed": 2, "success_rate": 0.8,
                "by_provider": {"openai": 5, "anthropic": 3},
                "by_type": {"pattern": 4, "pattern_recognition": 2, "logic": 2},
                "by_difficulty": {"easy": 5, "medium": 3},
            },
            "evaluation": {
                "evaluated": 8, "approved": 6, "rejected": 2, "failed": 0,
                "approval_rate": 0.75, "average_score": 0.82,
                "min_score": 0.4, "max_score": 0.97,
            },
            "deduplication": {
                "checked": 6, "duplicates_found": 1,
                "exact_duplicates": 1, "semantic_duplicates": 0, "duplicate_rate": 0.1667,
            },
            "database": { "inserted": 5, "failed": 0 },
            "api": { "total_calls": 16, "by_provider": {"openai": 10, "anthropic": 6} },
            "error_classification": {
                "by_category": {"server": 2}, "by_severity": {"high": 2},
                "critical_errors": 0,
            },
            "overall": {
                "questions_requested": 10, "questions_final_output": 5,
                "overall_success_rate": 0.5, "total_errors": 2,
            },
        })
    }

    #[test]
    fn payload_maps_summary_fields() {
        let payload = build_payload(&summary(), 3, &ReportContext::default());
        assert_eq!(payload["status"], "partial_failure");
        assert_eq!(payload["exit_code"], 3);
        assert_eq!(payload["questions_requested"], 10);
        assert_eq!(payload["questions_inserted"], 5);
        assert_eq!(payload["avg_arbiter_score"], 0.82);
        assert_eq!(payload["total_api_calls"], 16);
        assert_eq!(payload["provider_metrics"]["openai"]["generated"], 5);
        assert_eq!(payload["provider_metrics"]["openai"]["api_calls"], 10);
        assert_eq!(payload["error_summary"]["by_category"]["server"], 2);
    }

    #[test]
    fn type_breakdown_is_normalised_with_unknowns_preserved() {
        let mut raw = summary();
        raw["generation"]["by_type"]["mystery"] = json!(1);
        let payload = build_payload(&raw, 0, &ReportContext::default());
        // pattern + pattern_recognition collapse.
        assert_eq!(payload["type_metrics"]["pattern"], 6);
        assert_eq!(payload["type_metrics"]["logic"], 2);
        assert_eq!(payload["type_metrics"]["mystery"], 1);
        assert!(payload["type_metrics"].get("pattern_recognition").is_none());
    }

    #[test]
    fn status_table() {
        let overall_empty = json!({"questions_final_output": 0, "questions_requested": 5});
        assert_eq!(determine_status(0, &overall_empty), "success");
        assert_eq!(determine_status(3, &overall_empty), "partial_failure");
        for code in [1, 2, 4, 5, 6] {
            assert_eq!(determine_status(code, &overall_empty), "failed");
        }
        // Unknown codes derive from inserted vs requested.
        assert_eq!(determine_status(42, &overall_empty), "failed");
        let overall_partial = json!({"questions_final_output": 3, "questions_requested": 5});
        assert_eq!(determine_status(42, &overall_partial), "partial_failure");
        let overall_full = json!({"questions_final_output": 5, "questions_requested": 5});
        assert_eq!(determine_status(42, &overall_full), "success");
    }

    #[test]
    fn context_fields_ride_along() {
        let context = ReportContext {
            environment: Some("production".into()),
            triggered_by: Some("scheduler".into()),
            prompt_version: Some("2.4.1".into()),
            arbiter_config_version: Some("3.1".into()),
            min_arbiter_score_threshold: Some(0.7),
        };
        let payload = build_payload(&summary(), 0, &context);
        assert_eq!(payload["environment"], "production");
        assert_eq!(payload["triggered_by"], "scheduler");
        assert_eq!(payload["prompt_version"], "2.4.1");
        assert_eq!(payload["min_arbiter_score_threshold"], 0.7);
    }

    #[tokio::test]
    async fn unreachable_backend_returns_none() {
        // Port 9 (discard) refuses connections; the reporter must swallow
        // the failure and return None.
        let reporter = RunReporter::new("http://127.0.0.1:9", "test-key");
        let run_id = reporter
            .report_run(&summary(), 0, &ReportContext::default())
            .await;
        assert!(run_id.is_none());
    }
}
