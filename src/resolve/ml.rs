/*
 * depforge - Koji builds with automatic dependency resolution.
 * Copyright (C) 2025  depforge contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Similarity-based package name fallback.
//!
//! A trained corpus of provide-to-package examples is vectorized with
//! TF-IDF over character n-grams (2..=5, word-boundary padded) and queried
//! with brute-force cosine nearest-neighbor search. Predictions below the
//! confidence threshold are rejected. The resolver degrades to
//! `available() == false` when no model can be loaded; it never errors.

use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{DepforgeError, DepforgeResult};

/// Cosine distance above which predictions are rejected
const CONFIDENCE_THRESHOLD: f64 = 0.3;

/// Character n-gram range
const NGRAM_MIN: usize = 2;
const NGRAM_MAX: usize = 5;

/// In-memory prediction cache size
const MEMORY_CACHE_SIZE: usize = 512;

/// One training example mapping a provide token to package names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub provide: String,
    pub rpm_name: String,
    pub srpm_name: String,
}

/// A successful similarity lookup
#[derive(Debug, Clone)]
pub struct Prediction {
    pub rpm_name: String,
    pub srpm_name: String,
    pub distance: f64,
}

/// Persisted prediction cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPrediction {
    rpm: String,
    srpm: String,
    distance: f64,
    cached_at: i64,
}

/// TF-IDF vectorizer over word-boundary-padded character n-grams
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
}

/// Sparse L2-normalized feature vector, sorted by column index
type SparseVec = Vec<(usize, f64)>;

impl Vectorizer {
    /// Fit vocabulary and inverse document frequencies over the corpus
    fn fit(documents: &[String]) -> Self {
        let mut vocabulary: HashMap<String, usize> = HashMap::new();
        let mut document_frequency: Vec<usize> = Vec::new();

        for doc in documents {
            let mut seen = std::collections::HashSet::new();
            for gram in ngrams(doc) {
                let next_index = vocabulary.len();
                let index = *vocabulary.entry(gram).or_insert(next_index);
                if index == document_frequency.len() {
                    document_frequency.push(0);
                }
                if seen.insert(index) {
                    document_frequency[index] += 1;
                }
            }
        }

        let n_docs = documents.len() as f64;
        let idf = document_frequency
            .iter()
            .map(|&df| ((1.0 + n_docs) / (1.0 + df as f64)).ln() + 1.0)
            .collect();

        Self { vocabulary, idf }
    }

    /// Transform a document into a normalized sparse TF-IDF vector
    fn transform(&self, document: &str) -> SparseVec {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for gram in ngrams(document) {
            if let Some(&index) = self.vocabulary.get(&gram) {
                *counts.entry(index).or_insert(0.0) += 1.0;
            }
        }

        let mut vector: SparseVec = counts
            .into_iter()
            .map(|(index, tf)| (index, tf * self.idf[index]))
            .collect();
        vector.sort_unstable_by_key(|&(index, _)| index);

        let norm: f64 = vector.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, w) in &mut vector {
                *w /= norm;
            }
        }

        vector
    }
}

/// Character n-grams of each whitespace-separated word, space-padded at
/// the boundaries
fn ngrams(document: &str) -> Vec<String> {
    let mut grams = Vec::new();

    for word in document.split_whitespace() {
        let padded: Vec<char> = format!(" {} ", word).chars().collect();
        for n in NGRAM_MIN..=NGRAM_MAX {
            if padded.len() < n {
                continue;
            }
            for window in padded.windows(n) {
                grams.push(window.iter().collect());
            }
        }
    }

    grams
}

/// Dot product of two sorted sparse vectors
fn sparse_dot(a: &SparseVec, b: &SparseVec) -> f64 {
    let mut dot = 0.0;
    let mut i = 0;
    let mut j = 0;

    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }

    dot
}

/// Serialized model artifact
#[derive(Debug, Serialize, Deserialize)]
struct ModelData {
    vectorizer: Vectorizer,
    examples: Vec<TrainingExample>,
    confidence_threshold: f64,
}

/// Loaded model ready for queries
struct Model {
    vectorizer: Vectorizer,
    examples: Vec<TrainingExample>,
    matrix: Vec<SparseVec>,
}

impl Model {
    fn from_data(data: ModelData) -> Self {
        let matrix = data
            .examples
            .iter()
            .map(|ex| data.vectorizer.transform(&ex.provide))
            .collect();
        Self {
            vectorizer: data.vectorizer,
            examples: data.examples,
            matrix,
        }
    }
}

/// Similarity-based resolver over a trained provide-to-package corpus
pub struct MlResolver {
    threshold: f64,
    model: Option<Model>,
    memory_cache: Mutex<LruCache<String, Option<Prediction>>>,
    disk_cache: Mutex<HashMap<String, CachedPrediction>>,
    cache_file: PathBuf,
}

impl MlResolver {
    /// Create a resolver, loading the model from `model_path` or the
    /// default location. Load failures leave the resolver unavailable.
    pub fn new(model_path: Option<&Path>) -> Self {
        let resolved = model_path
            .map(|p| p.to_path_buf())
            .or_else(default_model_path);

        let mut resolver = Self::empty(default_cache_file());

        if let Some(path) = resolved {
            if path.exists() {
                if let Err(e) = resolver.load(&path) {
                    warn!("failed to load similarity model from {}: {}", path.display(), e);
                }
            }
        }

        resolver.load_disk_cache();
        resolver
    }

    /// Resolver with no model and a custom prediction cache location
    pub fn with_cache_file(cache_file: PathBuf) -> Self {
        let mut resolver = Self::empty(cache_file);
        resolver.load_disk_cache();
        resolver
    }

    fn empty(cache_file: PathBuf) -> Self {
        Self {
            threshold: CONFIDENCE_THRESHOLD,
            model: None,
            memory_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MEMORY_CACHE_SIZE).unwrap(),
            )),
            disk_cache: Mutex::new(HashMap::new()),
            cache_file,
        }
    }

    /// Whether the resolver is ready to make predictions
    pub fn available(&self) -> bool {
        self.model.is_some()
    }

    /// Re-fit the model over the given examples
    pub fn train(&mut self, examples: Vec<TrainingExample>) -> DepforgeResult<()> {
        if examples.is_empty() {
            return Err(DepforgeError::Config {
                message: "training data cannot be empty".to_string(),
            });
        }

        let provides: Vec<String> = examples.iter().map(|ex| ex.provide.clone()).collect();
        let vectorizer = Vectorizer::fit(&provides);
        debug!(
            "trained similarity model: {} examples, vocabulary size {}",
            examples.len(),
            vectorizer.vocabulary.len()
        );

        self.model = Some(Model::from_data(ModelData {
            vectorizer,
            examples,
            confidence_threshold: self.threshold,
        }));

        Ok(())
    }

    /// Save the trained model artifact
    pub fn save(&self, path: &Path) -> DepforgeResult<()> {
        let model = self.model.as_ref().ok_or_else(|| DepforgeError::Config {
            message: "no model to save; train or load one first".to_string(),
        })?;

        let data = ModelData {
            vectorizer: model.vectorizer.clone(),
            examples: model.examples.clone(),
            confidence_threshold: self.threshold,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DepforgeError::io(parent.display().to_string(), e))?;
        }

        let serialized = serde_json::to_string(&data).map_err(|e| DepforgeError::Config {
            message: format!("failed to serialize model: {}", e),
        })?;
        fs::write(path, serialized).map_err(|e| DepforgeError::io(path.display().to_string(), e))
    }

    /// Load a model artifact from disk
    pub fn load(&mut self, path: &Path) -> DepforgeResult<()> {
        let content =
            fs::read_to_string(path).map_err(|e| DepforgeError::io(path.display().to_string(), e))?;
        let data: ModelData = serde_json::from_str(&content).map_err(|e| DepforgeError::Config {
            message: format!("failed to deserialize model: {}", e),
        })?;

        self.threshold = data.confidence_threshold;
        let model = Model::from_data(data);
        debug!(
            "loaded similarity model from {} ({} examples)",
            path.display(),
            model.examples.len()
        );
        self.model = Some(model);
        Ok(())
    }

    /// Predict package names for a dependency token.
    ///
    /// Returns None when the model is unavailable or the nearest neighbor
    /// is farther than the confidence threshold.
    pub fn predict(&self, token: &str) -> Option<Prediction> {
        let model = self.model.as_ref()?;

        let key = cache_key(token);

        if let Some(cached) = self.memory_cache.lock().unwrap().get(&key) {
            return cached.clone();
        }

        if let Some(entry) = self.disk_cache.lock().unwrap().get(&key) {
            let prediction = Prediction {
                rpm_name: entry.rpm.clone(),
                srpm_name: entry.srpm.clone(),
                distance: entry.distance,
            };
            self.memory_cache
                .lock()
                .unwrap()
                .put(key, Some(prediction.clone()));
            return Some(prediction);
        }

        let query = model.vectorizer.transform(token);

        let mut best: Option<(usize, f64)> = None;
        for (index, row) in model.matrix.iter().enumerate() {
            let distance = 1.0 - sparse_dot(&query, row);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }

        let (index, distance) = best?;
        if distance > self.threshold {
            debug!(
                "prediction for '{}' below confidence (distance {:.3} > {:.3})",
                token, distance, self.threshold
            );
            self.memory_cache.lock().unwrap().put(key, None);
            return None;
        }

        let example = &model.examples[index];
        let prediction = Prediction {
            rpm_name: example.rpm_name.clone(),
            srpm_name: example.srpm_name.clone(),
            distance,
        };

        self.memory_cache
            .lock()
            .unwrap()
            .put(key.clone(), Some(prediction.clone()));
        self.store_disk_cache(key, &prediction);

        Some(prediction)
    }

    /// Load the persistent prediction cache; corrupt files count as empty
    fn load_disk_cache(&mut self) {
        if !self.cache_file.exists() {
            return;
        }

        let entries = fs::read_to_string(&self.cache_file)
            .ok()
            .and_then(|content| serde_json::from_str::<HashMap<String, CachedPrediction>>(&content).ok());

        match entries {
            Some(entries) => {
                debug!("loaded {} cached predictions", entries.len());
                *self.disk_cache.lock().unwrap() = entries;
            }
            None => {
                warn!(
                    "discarding corrupt prediction cache: {}",
                    self.cache_file.display()
                );
            }
        }
    }

    /// Record a prediction in the persistent cache
    fn store_disk_cache(&self, key: String, prediction: &Prediction) {
        let mut cache = self.disk_cache.lock().unwrap();
        cache.insert(
            key,
            CachedPrediction {
                rpm: prediction.rpm_name.clone(),
                srpm: prediction.srpm_name.clone(),
                distance: prediction.distance,
                cached_at: Utc::now().timestamp(),
            },
        );

        if let Some(parent) = self.cache_file.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&*cache) {
            Ok(serialized) => {
                if let Err(e) = fs::write(&self.cache_file, serialized) {
                    warn!("failed to save prediction cache: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize prediction cache: {}", e),
        }
    }
}

/// Stable cache key for a dependency token
fn cache_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))[..16].to_string()
}

fn default_model_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("depforge").join("model.json"))
}

fn default_cache_file() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("depforge")
        .join("ml_name_cache.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_examples() -> Vec<TrainingExample> {
        vec![
            TrainingExample {
                provide: "python3dist(requests)".to_string(),
                rpm_name: "python3-requests".to_string(),
                srpm_name: "python-requests".to_string(),
            },
            TrainingExample {
                provide: "python3dist(flask)".to_string(),
                rpm_name: "python3-flask".to_string(),
                srpm_name: "python-flask".to_string(),
            },
            TrainingExample {
                provide: "pkgconfig(glib-2.0)".to_string(),
                rpm_name: "glib2-devel".to_string(),
                srpm_name: "glib2".to_string(),
            },
            TrainingExample {
                provide: "font(:lang=en)".to_string(),
                rpm_name: "dejavu-sans-fonts".to_string(),
                srpm_name: "dejavu-fonts".to_string(),
            },
        ]
    }

    fn trained_resolver(dir: &Path) -> MlResolver {
        let mut resolver = MlResolver::with_cache_file(dir.join("cache.json"));
        resolver.train(sample_examples()).unwrap();
        resolver
    }

    #[test]
    fn test_unavailable_without_model() {
        let dir = tempdir().unwrap();
        let resolver = MlResolver::with_cache_file(dir.path().join("cache.json"));
        assert!(!resolver.available());
        assert!(resolver.predict("python3dist(requests)").is_none());
    }

    #[test]
    fn test_train_and_predict_exact() {
        let dir = tempdir().unwrap();
        let resolver = trained_resolver(dir.path());
        assert!(resolver.available());

        let prediction = resolver.predict("python3dist(requests)").unwrap();
        assert_eq!(prediction.rpm_name, "python3-requests");
        assert_eq!(prediction.srpm_name, "python-requests");
        assert!(prediction.distance < 0.01);
    }

    #[test]
    fn test_predict_near_miss() {
        let dir = tempdir().unwrap();
        let resolver = trained_resolver(dir.path());

        // A close variant of a known provide still resolves
        let prediction = resolver.predict("python3dist(request)").unwrap();
        assert_eq!(prediction.rpm_name, "python3-requests");
    }

    #[test]
    fn test_predict_rejects_distant_tokens() {
        let dir = tempdir().unwrap();
        let resolver = trained_resolver(dir.path());
        assert!(resolver.predict("qqwwzz(0000)").is_none());
    }

    #[test]
    fn test_train_empty_fails() {
        let dir = tempdir().unwrap();
        let mut resolver = MlResolver::with_cache_file(dir.path().join("cache.json"));
        assert!(resolver.train(Vec::new()).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let resolver = trained_resolver(dir.path());
        let model_path = dir.path().join("model.json");
        resolver.save(&model_path).unwrap();

        let mut loaded = MlResolver::with_cache_file(dir.path().join("cache2.json"));
        loaded.load(&model_path).unwrap();
        assert!(loaded.available());

        let prediction = loaded.predict("pkgconfig(glib-2.0)").unwrap();
        assert_eq!(prediction.rpm_name, "glib2-devel");
    }

    #[test]
    fn test_corrupt_cache_discarded() {
        let dir = tempdir().unwrap();
        let cache_file = dir.path().join("cache.json");
        fs::write(&cache_file, "{ not valid json !!!").unwrap();

        let mut resolver = MlResolver::with_cache_file(cache_file.clone());
        resolver.train(sample_examples()).unwrap();

        // Prediction succeeds despite the corrupt cache, and rewrites it
        let prediction = resolver.predict("python3dist(flask)").unwrap();
        assert_eq!(prediction.rpm_name, "python3-flask");

        let rewritten = fs::read_to_string(&cache_file).unwrap();
        assert!(serde_json::from_str::<HashMap<String, CachedPrediction>>(&rewritten).is_ok());
    }

    #[test]
    fn test_prediction_cache_persists() {
        let dir = tempdir().unwrap();
        let cache_file = dir.path().join("cache.json");

        {
            let mut resolver = MlResolver::with_cache_file(cache_file.clone());
            resolver.train(sample_examples()).unwrap();
            resolver.predict("python3dist(requests)").unwrap();
        }

        let content = fs::read_to_string(&cache_file).unwrap();
        let entries: HashMap<String, CachedPrediction> = serde_json::from_str(&content).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = entries.values().next().unwrap();
        assert_eq!(entry.rpm, "python3-requests");
    }

    #[test]
    fn test_ngrams_word_boundary_padding() {
        let grams = ngrams("ab");
        // " ab " yields bigrams " a", "ab", "b ", trigrams " ab", "ab ",
        // and the full padded 4-gram
        assert!(grams.contains(&" a".to_string()));
        assert!(grams.contains(&"ab".to_string()));
        assert!(grams.contains(&"b ".to_string()));
        assert!(grams.contains(&" ab ".to_string()));
    }

    #[test]
    fn test_sparse_dot_orthogonal() {
        let a = vec![(0, 1.0), (2, 1.0)];
        let b = vec![(1, 1.0), (3, 1.0)];
        assert_eq!(sparse_dot(&a, &b), 0.0);

        let c = vec![(0, 0.5), (1, 0.5)];
        let d = vec![(0, 0.5), (2, 0.5)];
        assert!((sparse_dot(&c, &d) - 0.25).abs() < 1e-9);
    }
}
