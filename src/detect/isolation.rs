//! Isolation forest over standardized run features.
//!
//! Each tree recursively splits a random subsample on a random feature at a
//! uniformly drawn threshold. Points that are isolated after few splits are
//! unusual. Scores follow the usual isolation-forest convention:
//! `score_sample` is `-2^(-E[h(x)] / c(n))`, and the decision offset is the
//! contamination percentile of the training scores, so a negative decision
//! value means "anomalous".

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::detect::features::{FeatureVector, FEATURE_COUNT};
use crate::detect::scaler::StandardScaler;
use crate::detect::stats;
use crate::detect::DetectError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Training parameters. Tree count and seed are fixed so the same history
/// always yields the same model.
#[derive(Debug, Clone)]
pub struct IsolationParams {
    pub n_trees: usize,
    pub max_samples: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationParams {
    fn default() -> Self {
        Self {
            n_trees: 200,
            max_samples: 256,
            contamination: 0.05,
            seed: 42,
        }
    }
}

impl IsolationParams {
    pub fn with_contamination(contamination: f64) -> Self {
        Self {
            contamination,
            ..Self::default()
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(rows: &[FeatureVector], indices: Vec<usize>, max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.build(rows, indices, 0, max_depth, rng);
        tree
    }

    fn build(
        &mut self,
        rows: &[FeatureVector],
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: indices.len() });
        if depth >= max_depth || indices.len() <= 1 {
            return id;
        }

        // Try features in random order until one is not constant in this node.
        let mut features: Vec<usize> = (0..FEATURE_COUNT).collect();
        features.shuffle(rng);
        let split = features.into_iter().find_map(|f| {
            let (lo, hi) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(rows[i][f]), hi.max(rows[i][f]))
            });
            (hi > lo).then_some((f, lo, hi))
        });
        let Some((feature, lo, hi)) = split else {
            return id;
        };

        let threshold = rng.gen_range(lo..hi);
        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| rows[i][feature] <= threshold);

        let left = self.build(rows, left_idx, depth + 1, max_depth, rng);
        let right = self.build(rows, right_idx, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, x: &FeatureVector) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// A fitted isolation forest. Operates on already-standardized vectors.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    offset: f64,
}

impl IsolationForest {
    pub fn fit(rows: &[FeatureVector], params: &IsolationParams) -> Result<Self, DetectError> {
        if rows.is_empty() {
            return Err(DetectError::EmptyTrainingSet);
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let sample_size = params.max_samples.min(rows.len()).max(1);
        let max_depth = ((sample_size as f64).log2().ceil() as usize).max(1);

        let trees = (0..params.n_trees.max(1))
            .map(|_| {
                let indices = rand::seq::index::sample(&mut rng, rows.len(), sample_size).into_vec();
                IsolationTree::grow(rows, indices, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            offset: 0.0,
        };
        let training_scores: Vec<f64> = rows.iter().map(|r| forest.score_sample(r)).collect();
        forest.offset = stats::percentile(&training_scores, 100.0 * params.contamination);
        Ok(forest)
    }

    /// Raw isolation score in [-1, 0); lower is more abnormal.
    pub fn score_sample(&self, x: &FeatureVector) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(x)).sum();
        let mean_depth = total / self.trees.len() as f64;
        let norm = average_path_length(self.sample_size).max(1.0);
        -(2f64).powf(-mean_depth / norm)
    }

    /// Shifted score: positive is normal, negative is anomalous.
    pub fn decision_function(&self, x: &FeatureVector) -> f64 {
        self.score_sample(x) - self.offset
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

/// Result of scoring one candidate with the isolation estimator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolationOutcome {
    /// Decision value; higher is more normal.
    pub normality: f64,
    pub predicted_anomaly: bool,
    /// `clamp(-normality, 0, 1)`.
    pub score: f64,
}

/// Isolation forest bundled with the scaler fit on the same history.
#[derive(Debug, Clone)]
pub struct IsolationModel {
    scaler: StandardScaler,
    forest: IsolationForest,
}

impl IsolationModel {
    pub fn train(history: &[FeatureVector], params: &IsolationParams) -> Result<Self, DetectError> {
        let scaler = StandardScaler::fit(history)?;
        let standardized = scaler.transform_all(history);
        let forest = IsolationForest::fit(&standardized, params)?;
        Ok(Self { scaler, forest })
    }

    pub fn evaluate(&self, candidate: &FeatureVector) -> IsolationOutcome {
        let x = self.scaler.transform(candidate);
        let normality = self.forest.decision_function(&x);
        IsolationOutcome {
            normality,
            predicted_anomaly: normality < 0.0,
            score: (-normality).clamp(0.0, 1.0),
        }
    }

    pub fn forest(&self) -> &IsolationForest {
        &self.forest
    }
}
