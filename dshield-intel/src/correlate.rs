//! Correlation scoring
//!
//! Pure functions that fold per-source results into one verdict using
//! reliability-weighted averages, weighted voting for categorical fields,
//! and a confidence threshold for indicators. A source that reported no
//! score contributes no signal; nothing here coerces a missing value to
//! zero.

use dshield_core::{
    CorrelationMetrics, IndicatorKind, SourceResult, ThreatIndicator, ThreatIntelligenceResult,
    ThreatSource,
};
use std::collections::BTreeMap;

/// Reliability weights keyed by source.
pub type Reliabilities = BTreeMap<ThreatSource, f64>;

/// Effective threat score for one source result.
///
/// A reputation-only source is converted via `threat = 100 - reputation`.
fn effective_threat_score(result: &SourceResult) -> Option<f64> {
    result
        .threat_score
        .or_else(|| result.reputation_score.map(|rep| 100.0 - rep))
}

/// Confidence for one source result, defaulting to the source reliability.
fn effective_confidence(result: &SourceResult, reliability: f64) -> f64 {
    result.confidence.unwrap_or(reliability)
}

fn reliability_of(reliabilities: &Reliabilities, source: ThreatSource) -> f64 {
    reliabilities
        .get(&source)
        .copied()
        .unwrap_or_else(|| source.default_reliability())
}

/// Position of a source in configuration order, the voting tiebreak.
fn config_position(source: ThreatSource) -> usize {
    ThreatSource::ALL
        .iter()
        .position(|s| *s == source)
        .unwrap_or(usize::MAX)
}

/// Correlate per-source results into the aggregate fields of `result`.
///
/// `enabled_count` is the number of configured enabled sources, used for
/// the data-completeness metric.
pub fn correlate(
    result: &mut ThreatIntelligenceResult,
    reliabilities: &Reliabilities,
    confidence_threshold: f64,
    enabled_count: usize,
) {
    if result.source_results.is_empty() {
        result.correlation_metrics = Some(CorrelationMetrics {
            source_count: 0,
            indicator_count: 0,
            data_completeness: 0.0,
            threat_score_variance: 0.0,
        });
        return;
    }

    // Weighted threat and confidence scores
    let mut threat_num = 0.0;
    let mut threat_den = 0.0;
    let mut conf_num = 0.0;
    let mut conf_den = 0.0;
    let mut threat_scores: Vec<f64> = Vec::new();

    for (source, source_result) in &result.source_results {
        let reliability = reliability_of(reliabilities, *source);

        if let Some(score) = effective_threat_score(source_result) {
            threat_num += score * reliability;
            threat_den += reliability;
            threat_scores.push(score);
        }

        conf_num += effective_confidence(source_result, reliability) * reliability;
        conf_den += reliability;
    }

    result.overall_threat_score = (threat_den > 0.0).then(|| threat_num / threat_den);
    result.confidence_score = (conf_den > 0.0).then(|| conf_num / conf_den);

    result.threat_indicators =
        correlate_indicators(&result.source_results, reliabilities, confidence_threshold);

    result.geographic_data = weighted_vote(&result.source_results, reliabilities, |sr| {
        [
            ("country", sr.country.as_ref()),
            ("region", sr.region.as_ref()),
            ("city", sr.city.as_ref()),
        ]
    });
    result.network_data = weighted_vote(&result.source_results, reliabilities, |sr| {
        [
            ("asn", sr.asn.as_ref()),
            ("organization", sr.organization.as_ref()),
            ("isp", sr.isp.as_ref()),
        ]
    });

    // Earliest first-seen, latest last-seen; reliability breaks exact ties
    result.first_seen = result
        .source_results
        .iter()
        .filter_map(|(source, sr)| {
            sr.first_seen
                .map(|ts| (ts, reliability_of(reliabilities, *source)))
        })
        .min_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        })
        .map(|(ts, _)| ts);
    result.last_seen = result
        .source_results
        .iter()
        .filter_map(|(source, sr)| {
            sr.last_seen
                .map(|ts| (ts, reliability_of(reliabilities, *source)))
        })
        .max_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        })
        .map(|(ts, _)| ts);

    let variance = if threat_scores.len() > 1 {
        let mean = threat_scores.iter().sum::<f64>() / threat_scores.len() as f64;
        threat_scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / threat_scores.len() as f64
    } else {
        0.0
    };

    result.correlation_metrics = Some(CorrelationMetrics {
        source_count: result.source_results.len(),
        indicator_count: result.threat_indicators.len(),
        data_completeness: result.source_results.len() as f64 / enabled_count.max(1) as f64,
        threat_score_variance: variance,
    });
}

/// Aggregate indicator strings across sources with weighted confidence.
fn correlate_indicators(
    source_results: &BTreeMap<ThreatSource, SourceResult>,
    reliabilities: &Reliabilities,
    confidence_threshold: f64,
) -> Vec<ThreatIndicator> {
    struct Accumulator {
        indicator: String,
        count: usize,
        sources: Vec<ThreatSource>,
        weighted_confidence_num: f64,
        weight: f64,
    }

    let mut accumulators: BTreeMap<String, Accumulator> = BTreeMap::new();

    for (source, source_result) in source_results {
        let reliability = reliability_of(reliabilities, *source);
        let confidence = effective_confidence(source_result, reliability);

        let reported = source_result
            .indicators
            .iter()
            .chain(source_result.attack_types.iter())
            .chain(source_result.tags.iter());

        for indicator in reported {
            let key = indicator.to_lowercase();
            let entry = accumulators.entry(key.clone()).or_insert(Accumulator {
                indicator: key,
                count: 0,
                sources: Vec::new(),
                weighted_confidence_num: 0.0,
                weight: 0.0,
            });
            entry.count += 1;
            if !entry.sources.contains(source) {
                entry.sources.push(*source);
            }
            entry.weighted_confidence_num += confidence * reliability;
            entry.weight += reliability;
        }
    }

    let mut indicators: Vec<ThreatIndicator> = accumulators
        .into_values()
        .filter_map(|acc| {
            let confidence = acc.weighted_confidence_num / acc.weight;
            (confidence >= confidence_threshold).then(|| ThreatIndicator {
                kind: IndicatorKind::classify(&acc.indicator),
                source_count: acc.sources.len(),
                indicator: acc.indicator,
                count: acc.count,
                sources: acc.sources,
                confidence,
            })
        })
        .collect();

    indicators.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.source_count.cmp(&a.source_count))
    });
    indicators
}

/// Weighted voting for categorical fields.
///
/// Each candidate value accumulates the reliabilities of the sources that
/// reported it; the heaviest value wins per field. Ties go to the value
/// whose reporting source appears earliest in configuration order.
fn weighted_vote<'a, F, I>(
    source_results: &'a BTreeMap<ThreatSource, SourceResult>,
    reliabilities: &Reliabilities,
    extract: F,
) -> BTreeMap<String, String>
where
    F: Fn(&'a SourceResult) -> I,
    I: IntoIterator<Item = (&'static str, Option<&'a String>)>,
{
    // field -> value -> (weight, best config position)
    let mut votes: BTreeMap<&'static str, BTreeMap<&'a String, (f64, usize)>> = BTreeMap::new();

    for (source, source_result) in source_results {
        let reliability = reliability_of(reliabilities, *source);
        let position = config_position(*source);
        for (field, value) in extract(source_result) {
            if let Some(value) = value {
                let slot = votes
                    .entry(field)
                    .or_default()
                    .entry(value)
                    .or_insert((0.0, position));
                slot.0 += reliability;
                slot.1 = slot.1.min(position);
            }
        }
    }

    votes
        .into_iter()
        .filter_map(|(field, candidates)| {
            candidates
                .into_iter()
                .max_by(|a, b| {
                    (a.1 .0)
                        .partial_cmp(&b.1 .0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        // Lower config position wins a tie
                        .then(b.1 .1.cmp(&a.1 .1))
                })
                .map(|(value, _)| (field.to_string(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn reliabilities() -> Reliabilities {
        ThreatSource::ALL
            .into_iter()
            .map(|s| (s, s.default_reliability()))
            .collect()
    }

    fn result_with(sources: Vec<(ThreatSource, SourceResult)>) -> ThreatIntelligenceResult {
        let mut result = ThreatIntelligenceResult::new("192.0.2.1");
        result.source_results = sources.into_iter().collect();
        result.sources_queried = result.source_results.keys().copied().collect();
        result
    }

    #[test]
    fn test_weighted_threat_score() {
        // (80 * 0.9 + 60 * 0.7) / (0.9 + 0.7) = 71.25
        let mut result = result_with(vec![
            (
                ThreatSource::Virustotal,
                SourceResult {
                    threat_score: Some(80.0),
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Shodan,
                SourceResult {
                    threat_score: Some(60.0),
                    ..Default::default()
                },
            ),
        ]);
        correlate(&mut result, &reliabilities(), 0.7, 2);

        let score = result.overall_threat_score.expect("score expected");
        assert!((score - 71.25).abs() < 0.01);
    }

    #[test]
    fn test_agreeing_sources_cancel_weights() {
        let mut result = result_with(
            [ThreatSource::Dshield, ThreatSource::Virustotal, ThreatSource::Threatfox]
                .into_iter()
                .map(|s| {
                    (
                        s,
                        SourceResult {
                            threat_score: Some(55.0),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        );
        correlate(&mut result, &reliabilities(), 0.7, 3);

        let score = result.overall_threat_score.expect("score expected");
        assert!((score - 55.0).abs() < 1e-9);
        let metrics = result.correlation_metrics.expect("metrics expected");
        assert_eq!(metrics.threat_score_variance, 0.0);
    }

    #[test]
    fn test_reputation_converts_to_threat() {
        let mut result = result_with(vec![(
            ThreatSource::Dshield,
            SourceResult {
                reputation_score: Some(30.0),
                ..Default::default()
            },
        )]);
        correlate(&mut result, &reliabilities(), 0.7, 1);
        assert_eq!(result.overall_threat_score, Some(70.0));
    }

    #[test]
    fn test_missing_scores_are_no_signal() {
        let mut result = result_with(vec![
            (
                ThreatSource::Dshield,
                SourceResult {
                    threat_score: Some(90.0),
                    ..Default::default()
                },
            ),
            // Answered, but scored nothing: must not drag the average to 0
            (ThreatSource::Shodan, SourceResult::default()),
        ]);
        correlate(&mut result, &reliabilities(), 0.7, 2);
        assert_eq!(result.overall_threat_score, Some(90.0));
    }

    #[test]
    fn test_no_scoring_source_leaves_score_none() {
        let mut result = result_with(vec![(ThreatSource::Shodan, SourceResult::default())]);
        correlate(&mut result, &reliabilities(), 0.7, 1);
        assert_eq!(result.overall_threat_score, None);
        // Confidence still aggregates from defaults
        assert!(result.confidence_score.is_some());
    }

    #[test]
    fn test_indicator_threshold_and_ordering() {
        let mut result = result_with(vec![
            (
                ThreatSource::Virustotal,
                SourceResult {
                    confidence: Some(0.95),
                    indicators: vec!["ssh-bruteforce".into(), "weak-signal".into()],
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Dshield,
                SourceResult {
                    confidence: Some(0.9),
                    attack_types: vec!["ssh-bruteforce".into()],
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Threatfox,
                SourceResult {
                    confidence: Some(0.2),
                    tags: vec!["noise".into()],
                    ..Default::default()
                },
            ),
        ]);
        correlate(&mut result, &reliabilities(), 0.7, 3);

        // "noise" (confidence 0.2) is dropped; the two survivors are
        // ordered by confidence then source count
        let names: Vec<&str> = result
            .threat_indicators
            .iter()
            .map(|i| i.indicator.as_str())
            .collect();
        assert_eq!(names, vec!["ssh-bruteforce", "weak-signal"]);
        assert_eq!(result.threat_indicators[0].source_count, 2);
        assert_eq!(result.threat_indicators[0].kind, IndicatorKind::Generic);
    }

    #[test]
    fn test_geographic_weighted_voting() {
        let mut result = result_with(vec![
            (
                ThreatSource::Virustotal, // 0.9
                SourceResult {
                    country: Some("NL".into()),
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Dshield, // 0.8
                SourceResult {
                    country: Some("CN".into()),
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Shodan, // 0.7; CN now outweighs NL 1.5 to 0.9
                SourceResult {
                    country: Some("CN".into()),
                    city: Some("Beijing".into()),
                    ..Default::default()
                },
            ),
        ]);
        correlate(&mut result, &reliabilities(), 0.7, 3);

        assert_eq!(result.geographic_data.get("country").map(String::as_str), Some("CN"));
        assert_eq!(result.geographic_data.get("city").map(String::as_str), Some("Beijing"));
    }

    #[test]
    fn test_vote_tie_breaks_by_configuration_order() {
        let mut reliabilities = reliabilities();
        reliabilities.insert(ThreatSource::Dshield, 0.8);
        reliabilities.insert(ThreatSource::Abuseipdb, 0.8);

        let mut result = result_with(vec![
            (
                ThreatSource::Abuseipdb,
                SourceResult {
                    organization: Some("Acme Hosting".into()),
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Dshield,
                SourceResult {
                    organization: Some("Evil ISP".into()),
                    ..Default::default()
                },
            ),
        ]);
        correlate(&mut result, &reliabilities, 0.7, 2);

        // Equal weight: dshield precedes abuseipdb in configuration order
        assert_eq!(
            result.network_data.get("organization").map(String::as_str),
            Some("Evil ISP")
        );
    }

    #[test]
    fn test_timestamps_min_max() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut result = result_with(vec![
            (
                ThreatSource::Dshield,
                SourceResult {
                    first_seen: Some(late),
                    last_seen: Some(late),
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Shodan,
                SourceResult {
                    first_seen: Some(early),
                    last_seen: Some(early),
                    ..Default::default()
                },
            ),
        ]);
        correlate(&mut result, &reliabilities(), 0.7, 2);

        assert_eq!(result.first_seen, Some(early));
        assert_eq!(result.last_seen, Some(late));
    }

    #[test]
    fn test_metrics_completeness_and_variance() {
        let mut result = result_with(vec![
            (
                ThreatSource::Dshield,
                SourceResult {
                    threat_score: Some(40.0),
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Virustotal,
                SourceResult {
                    threat_score: Some(60.0),
                    ..Default::default()
                },
            ),
        ]);
        correlate(&mut result, &reliabilities(), 0.7, 4);

        let metrics = result.correlation_metrics.expect("metrics expected");
        assert_eq!(metrics.source_count, 2);
        assert_eq!(metrics.data_completeness, 0.5);
        // Population variance of {40, 60} is 100
        assert!((metrics.threat_score_variance - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_stays_in_unit_interval() {
        let mut result = result_with(vec![
            (
                ThreatSource::Virustotal,
                SourceResult {
                    confidence: Some(1.0),
                    ..Default::default()
                },
            ),
            (
                ThreatSource::Shodan,
                SourceResult {
                    confidence: Some(0.9),
                    // No threat score: confidence denominator still counts it
                    ..Default::default()
                },
            ),
        ]);
        correlate(&mut result, &reliabilities(), 0.7, 2);

        let confidence = result.confidence_score.expect("confidence expected");
        assert!((0.0..=1.0).contains(&confidence));
        assert!(result.validate().is_ok());
    }
}
