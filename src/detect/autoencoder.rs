//! Bottleneck autoencoder used as the reconstruction estimator.
//!
//! Dense layers `7 -> 16 -> 8 -> 16 -> 7` with ReLU hidden activations and a
//! linear output, trained with Adam on mean squared reconstruction error of
//! standardized run features. Weights use Glorot-uniform initialisation from a
//! seeded RNG, so training is reproducible for a given history.

use ndarray::{Array1, Array2, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::detect::features::{FeatureVector, FEATURE_COUNT};
use crate::detect::scaler::StandardScaler;
use crate::detect::stats;
use crate::detect::DetectError;

/// Hidden layer widths between the input and output layers.
const HIDDEN_WIDTHS: [usize; 3] = [16, 8, 16];

/// Guards the score division when every historical error is zero.
pub const THRESHOLD_EPSILON: f64 = 1e-9;

/// Percentile of historical errors used as the decision threshold.
pub const THRESHOLD_PERCENTILE: f64 = 90.0;

#[derive(Debug, Clone)]
pub struct AutoencoderParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for AutoencoderParams {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 16,
            learning_rate: 1e-3,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Relu,
    Linear,
}

#[derive(Debug, Clone)]
struct Dense {
    weights: Array2<f64>,
    bias: Array1<f64>,
    activation: Activation,
    // Adam moments
    m_w: Array2<f64>,
    v_w: Array2<f64>,
    m_b: Array1<f64>,
    v_b: Array1<f64>,
}

impl Dense {
    fn new(inputs: usize, outputs: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (inputs + outputs) as f64).sqrt();
        let weights = Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-limit..limit));
        Self {
            weights,
            bias: Array1::zeros(outputs),
            activation,
            m_w: Array2::zeros((inputs, outputs)),
            v_w: Array2::zeros((inputs, outputs)),
            m_b: Array1::zeros(outputs),
            v_b: Array1::zeros(outputs),
        }
    }

    /// Returns (pre-activation, activation).
    fn forward(&self, input: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        let z = input.dot(&self.weights) + &self.bias;
        let a = match self.activation {
            Activation::Relu => z.mapv(|v| v.max(0.0)),
            Activation::Linear => z.clone(),
        };
        (z, a)
    }
}

struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: i32,
}

impl Adam {
    fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            step: 0,
        }
    }

    fn update(&self, layer: &mut Dense, grad_w: &Array2<f64>, grad_b: &Array1<f64>) {
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        let lr_t = self.lr * (1.0 - b2.powi(self.step)).sqrt() / (1.0 - b1.powi(self.step));

        Zip::from(&mut layer.weights)
            .and(&mut layer.m_w)
            .and(&mut layer.v_w)
            .and(grad_w)
            .for_each(|w, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *w -= lr_t * *m / (v.sqrt() + eps);
            });
        Zip::from(&mut layer.bias)
            .and(&mut layer.m_b)
            .and(&mut layer.v_b)
            .and(grad_b)
            .for_each(|w, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *w -= lr_t * *m / (v.sqrt() + eps);
            });
    }
}

/// The trained network; expects standardized input.
#[derive(Debug, Clone)]
pub struct Autoencoder {
    layers: Vec<Dense>,
}

impl Autoencoder {
    fn init(rng: &mut StdRng) -> Self {
        let mut widths = vec![FEATURE_COUNT];
        widths.extend_from_slice(&HIDDEN_WIDTHS);
        widths.push(FEATURE_COUNT);

        let last = widths.len() - 2;
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let activation = if i == last {
                    Activation::Linear
                } else {
                    Activation::Relu
                };
                Dense::new(w[0], w[1], activation, rng)
            })
            .collect();
        Self { layers }
    }

    pub fn fit(data: &Array2<f64>, params: &AutoencoderParams) -> Result<Self, DetectError> {
        let n = data.nrows();
        if n == 0 {
            return Err(DetectError::EmptyTrainingSet);
        }
        if data.ncols() != FEATURE_COUNT {
            return Err(DetectError::Shape(format!(
                "expected {} columns, got {}",
                FEATURE_COUNT,
                data.ncols()
            )));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut net = Self::init(&mut rng);
        let mut adam = Adam::new(params.learning_rate);
        let batch_size = params.batch_size.max(1);
        let mut order: Vec<usize> = (0..n).collect();

        for _ in 0..params.epochs {
            order.shuffle(&mut rng);
            for chunk in order.chunks(batch_size) {
                let batch = data.select(Axis(0), chunk);
                adam.step += 1;
                net.train_step(&batch, &adam);
            }
        }
        Ok(net)
    }

    fn train_step(&mut self, batch: &Array2<f64>, adam: &Adam) {
        // Forward pass, keeping every layer's input and pre-activation.
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_acts = Vec::with_capacity(self.layers.len());
        let mut current = batch.clone();
        for layer in &self.layers {
            let (z, a) = layer.forward(&current);
            inputs.push(current);
            pre_acts.push(z);
            current = a;
        }

        // d(mean squared error)/d(output)
        let scale = 2.0 / (batch.nrows() * batch.ncols()) as f64;
        let mut grad = (&current - batch) * scale;

        for i in (0..self.layers.len()).rev() {
            let dz = match self.layers[i].activation {
                Activation::Relu => {
                    let mask = pre_acts[i].mapv(|z| if z > 0.0 { 1.0 } else { 0.0 });
                    grad * mask
                }
                Activation::Linear => grad,
            };
            let grad_w = inputs[i].t().dot(&dz);
            let grad_b = dz.sum_axis(Axis(0));
            grad = dz.dot(&self.layers[i].weights.t());
            adam.update(&mut self.layers[i], &grad_w, &grad_b);
        }
    }

    pub fn reconstruct(&self, data: &Array2<f64>) -> Array2<f64> {
        self.layers
            .iter()
            .fold(data.clone(), |current, layer| layer.forward(&current).1)
    }

    /// Per-row mean squared reconstruction error.
    pub fn reconstruction_errors(&self, data: &Array2<f64>) -> Vec<f64> {
        let out = self.reconstruct(data);
        (&out - data)
            .mapv(|d| d * d)
            .mean_axis(Axis(1))
            .map(|m| m.to_vec())
            .unwrap_or_default()
    }
}

fn to_matrix(rows: &[FeatureVector]) -> Result<Array2<f64>, DetectError> {
    let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((rows.len(), FEATURE_COUNT), flat)
        .map_err(|e| DetectError::Shape(e.to_string()))
}

/// Result of scoring one candidate with the reconstruction estimator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconstructionOutcome {
    pub error: f64,
    pub threshold: f64,
    pub predicted_anomaly: bool,
    /// `min(1, error / (threshold + eps))`.
    pub score: f64,
}

/// Autoencoder bundled with the scaler fit on the same history.
#[derive(Debug, Clone)]
pub struct ReconstructionModel {
    scaler: StandardScaler,
    network: Autoencoder,
}

impl ReconstructionModel {
    pub fn train(history: &[FeatureVector], params: &AutoencoderParams) -> Result<Self, DetectError> {
        let scaler = StandardScaler::fit(history)?;
        let standardized = to_matrix(&scaler.transform_all(history))?;
        let network = Autoencoder::fit(&standardized, params)?;
        Ok(Self { scaler, network })
    }

    pub fn errors(&self, rows: &[FeatureVector]) -> Result<Vec<f64>, DetectError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let standardized = to_matrix(&self.scaler.transform_all(rows))?;
        Ok(self.network.reconstruction_errors(&standardized))
    }

    /// Score `candidate` against a threshold taken from the reconstruction
    /// errors of `reference` (the most recent historical points).
    pub fn evaluate(
        &self,
        candidate: &FeatureVector,
        reference: &[FeatureVector],
    ) -> Result<ReconstructionOutcome, DetectError> {
        let error = self
            .errors(std::slice::from_ref(candidate))?
            .first()
            .copied()
            .unwrap_or(0.0);
        let threshold = stats::percentile(&self.errors(reference)?, THRESHOLD_PERCENTILE);
        Ok(ReconstructionOutcome {
            error,
            threshold,
            predicted_anomaly: error > threshold,
            score: (error / (threshold + THRESHOLD_EPSILON)).min(1.0),
        })
    }
}
