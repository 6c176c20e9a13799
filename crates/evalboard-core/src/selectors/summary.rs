use crate::metrics_cache::RunMetrics;
use crate::model::EvaluatorDef;
use evalboard_metrics::{metric_key, summarize, MetricSummary};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummaryRow {
    pub key: String,
    pub name: String,
    pub count: u64,
    pub summary: MetricSummary,
}

/// Headline values for one evaluator's chart card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatorSummary {
    pub slug: String,
    pub name: String,
    pub metrics: Vec<MetricSummaryRow>,
}

/// One row per declared metric, in declaration order. Metrics nobody
/// reported summarize to `Empty`.
pub fn evaluator_summaries(evaluators: &[EvaluatorDef], metrics: &RunMetrics) -> Vec<EvaluatorSummary> {
    evaluators
        .iter()
        .map(|e| EvaluatorSummary {
            slug: e.slug.clone(),
            name: if e.name.is_empty() {
                e.slug.clone()
            } else {
                e.name.clone()
            },
            metrics: e
                .metrics
                .iter()
                .map(|def| {
                    let key = metric_key(&e.slug, &def.name);
                    let (count, summary) = match metrics.get(&key) {
                        Some(m) => (m.count, summarize(m)),
                        None => (0, MetricSummary::Empty),
                    };
                    MetricSummaryRow {
                        key,
                        name: def.name.clone(),
                        count,
                        summary,
                    }
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalboard_metrics::{compute_run_metrics, ScenarioOutput};
    use serde_json::json;

    #[test]
    fn boolean_metric_summarizes_to_true_share() {
        let evaluators: Vec<EvaluatorDef> = serde_json::from_value(json!([
            {"slug": "exact_match", "metrics": [{"name": "success", "kind": "boolean"}]},
            {"slug": "judge", "name": "LLM judge", "metrics": [{"name": "score"}]}
        ]))
        .unwrap();
        let outputs = vec![
            ScenarioOutput::new("s1").with("exact_match.success", json!(true)),
            ScenarioOutput::new("s2").with("exact_match.success", json!(false)),
            ScenarioOutput::new("s3").with("exact_match.success", json!(true)),
        ];
        let metrics = compute_run_metrics(&outputs, &Default::default());

        let summaries = evaluator_summaries(&evaluators, &metrics);
        assert_eq!(summaries[0].name, "exact_match");
        let row = &summaries[0].metrics[0];
        assert_eq!(row.count, 3);
        match &row.summary {
            MetricSummary::MostFrequent { value, percentage } => {
                assert_eq!(value, &json!(true));
                assert!((percentage - 200.0 / 3.0).abs() < 1e-9);
            }
            other => panic!("unexpected summary {:?}", other),
        }

        assert_eq!(summaries[1].name, "LLM judge");
        assert_eq!(summaries[1].metrics[0].summary, MetricSummary::Empty);
    }
}
