use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::types::{is_likely_foreign_key, FieldReport, FieldStatistics, SchemaReport};

const ARRAY_TAG: &str = "[]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Deepest path (in segments) that is flattened.
    pub max_depth: usize,
    /// Documents analyzed before the statistics freeze.
    pub sample_size: usize,
    /// Fixed seed for batch down-sampling. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            sample_size: 128,
            seed: None,
        }
    }
}

/// Profiles a sample of loosely-structured JSON objects.
///
/// Statistics accumulate across `analyze` calls until `sample_size` documents
/// have been seen; later documents are ignored until `reset`.
pub struct SchemaAnalyzer {
    config: SchemaConfig,
    fields: BTreeMap<String, FieldStatistics>,
    /// Paths that were keys of a document root. Keys may contain dots.
    top_level: BTreeSet<String>,
    documents_analyzed: usize,
    rng: StdRng,
}

impl SchemaAnalyzer {
    pub fn new(config: SchemaConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            fields: BTreeMap::new(),
            top_level: BTreeSet::new(),
            documents_analyzed: 0,
            rng,
        }
    }

    pub fn config(&self) -> &SchemaConfig {
        &self.config
    }

    pub fn documents_analyzed(&self) -> usize {
        self.documents_analyzed
    }

    fn remaining_capacity(&self) -> usize {
        self.config.sample_size.saturating_sub(self.documents_analyzed)
    }

    /// Fold one document into the statistics. Returns `false` when the
    /// document was not counted: the sample is full or it is not an object.
    pub fn analyze(&mut self, document: &Value) -> bool {
        if self.remaining_capacity() == 0 {
            return false;
        }
        let Value::Object(map) = document else {
            tracing::debug!("Schema analyzer skipped non-object document");
            return false;
        };

        self.documents_analyzed += 1;
        self.flatten(map, "", 1);
        true
    }

    /// Analyze a batch, uniformly sampling its objects down to the remaining
    /// capacity when there are more. Returns how many documents were counted.
    pub fn analyze_batch(&mut self, documents: &[Value]) -> usize {
        let capacity = self.remaining_capacity();
        if capacity == 0 {
            tracing::debug!(ignored = documents.len(), "Schema sample full, batch ignored");
            return 0;
        }

        let objects: Vec<&Value> = documents.iter().filter(|d| d.is_object()).collect();
        if objects.len() < documents.len() {
            tracing::debug!(
                skipped = documents.len() - objects.len(),
                "Schema batch contains non-object documents"
            );
        }

        if objects.len() <= capacity {
            return objects.into_iter().filter(|d| self.analyze(d)).count();
        }

        let mut picked =
            rand::seq::index::sample(&mut self.rng, objects.len(), capacity).into_vec();
        picked.sort_unstable();
        tracing::info!(
            batch = objects.len(),
            sampled = picked.len(),
            "Schema batch exceeds capacity, sampling"
        );

        picked
            .into_iter()
            .filter(|&i| self.analyze(objects[i]))
            .count()
    }

    fn flatten(&mut self, map: &Map<String, Value>, prefix: &str, depth: usize) {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            self.fields.entry(path.clone()).or_default().observe(value);
            if prefix.is_empty() {
                self.top_level.insert(path.clone());
            }

            match value {
                Value::Object(child) if depth < self.config.max_depth => {
                    self.flatten(child, &path, depth + 1);
                }
                // Only the first element decides whether an array holds records.
                Value::Array(items) => {
                    if let Some(first @ Value::Object(child)) = items.first() {
                        let tagged = format!("{path}{ARRAY_TAG}");
                        self.fields.entry(tagged.clone()).or_default().observe(first);
                        if depth < self.config.max_depth {
                            self.flatten(child, &tagged, depth + 1);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    pub fn summary(&self) -> SchemaReport {
        let docs = self.documents_analyzed;
        let ratio = |n: usize| if docs == 0 { 0.0 } else { n as f64 / docs as f64 };

        let top_level: Vec<f64> = self
            .fields
            .iter()
            .filter(|(path, _)| self.top_level.contains(*path))
            .map(|(_, stats)| ratio(stats.presence_count))
            .collect();
        let field_stability = mean(&top_level);

        let per_path: Vec<f64> = self.fields.values().map(|s| s.type_stability()).collect();
        let type_stability = mean(&per_path);

        let mut hasher = Sha256::new();
        let mut fields = Vec::with_capacity(self.fields.len());
        for (path, stats) in &self.fields {
            let Some((dominant, _)) = stats.dominant_type() else {
                continue;
            };
            hasher.update(format!("{path}:{}\n", dominant.as_str()).as_bytes());

            let null_ratio = if stats.presence_count == 0 {
                0.0
            } else {
                stats.null_count as f64 / stats.presence_count as f64
            };
            fields.push(FieldReport {
                path: path.clone(),
                dominant_type: dominant,
                type_stability: stats.type_stability(),
                presence_ratio: ratio(stats.presence_count),
                null_ratio,
                max_string_length: stats.max_string_length,
                type_histogram: stats.type_histogram.clone(),
                sample_values: stats.sample_values.clone(),
                likely_foreign_key: is_likely_foreign_key(path),
            });
        }

        SchemaReport {
            documents_analyzed: docs,
            field_stability,
            type_stability,
            structure_hash: format!("{:x}", hasher.finalize()),
            fields,
        }
    }

    pub fn reset(&mut self) {
        self.fields.clear();
        self.top_level.clear();
        self.documents_analyzed = 0;
    }
}

impl Default for SchemaAnalyzer {
    fn default() -> Self {
        Self::new(SchemaConfig::default())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::JsonType;
    use serde_json::json;

    fn seeded(sample_size: usize) -> SchemaAnalyzer {
        SchemaAnalyzer::new(SchemaConfig {
            sample_size,
            seed: Some(7),
            ..Default::default()
        })
    }

    #[test]
    fn mixed_types_lower_type_stability() {
        let mut analyzer = SchemaAnalyzer::default();
        let docs = [json!({"a": 1}), json!({"a": "x"}), json!({"a": 2})];
        assert_eq!(analyzer.analyze_batch(&docs), 3);

        let report = analyzer.summary();
        let a = report.field("a").unwrap();
        assert_eq!(a.dominant_type, JsonType::Integer);
        assert!((a.type_stability - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.type_stability - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.field_stability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn flattens_nested_objects_to_max_depth() {
        let mut analyzer = SchemaAnalyzer::default();
        analyzer.analyze(&json!({
            "asset": {"meta": {"camera": {"model": "X100"}}},
            "title": "Harbour at dusk"
        }));

        let report = analyzer.summary();
        let paths: Vec<&str> = report.fields.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["asset", "asset.meta", "asset.meta.camera", "title"]
        );
        assert_eq!(
            report.field("asset.meta.camera").unwrap().dominant_type,
            JsonType::Object
        );
    }

    #[test]
    fn arrays_of_objects_get_tagged_paths() {
        let mut analyzer = SchemaAnalyzer::default();
        analyzer.analyze(&json!({
            "tags": ["a", "b"],
            "items": [{"sku_id": "A1", "qty": 2}, {"other": true}]
        }));

        let report = analyzer.summary();
        assert_eq!(report.field("tags").unwrap().dominant_type, JsonType::Array);
        assert!(report.field("tags[]").is_none());
        assert_eq!(report.field("items[]").unwrap().dominant_type, JsonType::Object);
        assert!(report.field("items[].sku_id").unwrap().likely_foreign_key);
        assert!(report.field("items[].qty").is_some());
        // Only the first element is inspected.
        assert!(report.field("items[].other").is_none());
    }

    #[test]
    fn field_stability_ignores_nested_and_tagged_paths() {
        let mut analyzer = SchemaAnalyzer::default();
        analyzer.analyze(&json!({"id": 1, "meta": {"x": 1}, "rows": [{"y": 1}]}));
        analyzer.analyze(&json!({"id": 2}));

        let report = analyzer.summary();
        // id: 1.0, meta: 0.5, rows: 0.5
        assert!((report.field_stability - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.field("meta.x").unwrap().presence_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dotted_top_level_keys_count_toward_field_stability() {
        let mut analyzer = SchemaAnalyzer::default();
        analyzer.analyze(&json!({"id": 1, "geo.lat": 51.5, "tags[]": "x"}));
        analyzer.analyze(&json!({"id": 2}));

        let report = analyzer.summary();
        // id: 1.0, geo.lat: 0.5, tags[]: 0.5
        assert!((report.field_stability - 2.0 / 3.0).abs() < 1e-9);
        assert!(report.field("geo.lat").is_some());
    }

    #[test]
    fn nulls_are_counted() {
        let mut analyzer = SchemaAnalyzer::default();
        analyzer.analyze_batch(&[json!({"note": null}), json!({"note": "hi"})]);
        let note = analyzer.summary().field("note").cloned().unwrap();
        assert!((note.null_ratio - 0.5).abs() < 1e-9);
        assert_eq!(note.max_string_length, 2);
        assert_eq!(note.sample_values, vec![json!("hi")]);
    }

    #[test]
    fn sample_cap_freezes_statistics() {
        let mut analyzer = seeded(2);
        assert!(analyzer.analyze(&json!({"a": 1})));
        assert!(analyzer.analyze(&json!({"a": 2})));
        assert!(!analyzer.analyze(&json!({"b": 3})));

        let report = analyzer.summary();
        assert_eq!(report.documents_analyzed, 2);
        assert!(report.field("b").is_none());
    }

    #[test]
    fn oversized_batch_is_sampled_down() {
        let docs: Vec<Value> = (0..50).map(|i| json!({"n": i})).collect();
        let mut analyzer = seeded(10);
        assert_eq!(analyzer.analyze_batch(&docs), 10);
        assert_eq!(analyzer.documents_analyzed(), 10);
        assert_eq!(analyzer.analyze_batch(&docs), 0);
    }

    #[test]
    fn non_objects_do_not_use_up_the_sample() {
        let mut docs: Vec<Value> = (0..20).map(|i| json!(i)).collect();
        docs.extend((0..20).map(|i| json!({"n": i})));
        let mut analyzer = seeded(10);
        assert_eq!(analyzer.analyze_batch(&docs), 10);
        assert_eq!(analyzer.documents_analyzed(), 10);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let docs: Vec<Value> = (0..40).map(|i| json!({ format!("k{i}"): i })).collect();
        let mut first = seeded(5);
        let mut second = seeded(5);
        first.analyze_batch(&docs);
        second.analyze_batch(&docs);
        assert_eq!(first.summary(), second.summary());
    }

    #[test]
    fn non_objects_are_not_counted() {
        let mut analyzer = SchemaAnalyzer::default();
        assert!(!analyzer.analyze(&json!([1, 2, 3])));
        assert!(!analyzer.analyze(&json!("text")));
        assert_eq!(analyzer.documents_analyzed(), 0);
    }

    #[test]
    fn structure_hash_tracks_dominant_types() {
        let mut a = SchemaAnalyzer::default();
        let mut b = SchemaAnalyzer::default();
        a.analyze(&json!({"x": 1, "y": "s"}));
        b.analyze(&json!({"y": "other", "x": 99}));
        assert_eq!(a.summary().structure_hash, b.summary().structure_hash);
        assert_eq!(a.summary().structure_hash.len(), 64);

        b.analyze(&json!({"x": "now a string"}));
        b.analyze(&json!({"x": "again"}));
        assert_ne!(a.summary().structure_hash, b.summary().structure_hash);
    }

    #[test]
    fn reset_clears_everything() {
        let mut analyzer = seeded(1);
        analyzer.analyze(&json!({"a": 1}));
        analyzer.reset();
        assert_eq!(analyzer.summary().fields.len(), 0);
        assert!(analyzer.analyze(&json!({"a": 1})));
    }
}
