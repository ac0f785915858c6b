//! Components to build a neural network

use std::{
    cell::RefCell,
    sync::atomic::{self, AtomicUsize},
};

use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::values::Value;

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected} values, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),
    #[error("Target class {target} out of range for {n_classes} classes")]
    TargetOutOfRange { target: usize, n_classes: usize },
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Value>;
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError>;
}

/// He initialization, a sample of `N(0, 2 / fan_in)`
fn he_normal<R: Rng + ?Sized>(fan_in: usize, rng: &mut R) -> f32 {
    let std = (2.0 / fan_in as f32).sqrt();
    let z: f32 = rng.sample(StandardNormal);
    z * std
}

/// A single neuron in a layer of a NN
pub struct Neuron {
    /// weights of the neuron, one per input
    pub weights: Vec<Value>,
    /// bias of the neuron
    pub bias: Value,
}

impl Neuron {
    fn new<R: Rng + ?Sized>(n_inputs: usize, rng: &mut R) -> Self {
        let weights = (0..n_inputs)
            .map(|_| Value::new(he_normal(n_inputs, rng)))
            .collect();
        Self {
            weights,
            bias: Value::new(he_normal(n_inputs, rng)),
        }
    }

    // Testing utility for a deterministic and simple neuron
    #[cfg(test)]
    fn new_ones(n_inputs: usize) -> Self {
        Self {
            weights: (0..n_inputs).map(|_| Value::new(1.0)).collect(),
            bias: Value::new(1.0),
        }
    }

    pub fn parameters(&self) -> Vec<Value> {
        self.weights
            .iter()
            .chain(std::iter::once(&self.bias))
            .cloned()
            .collect()
    }

    pub fn forward(&self, inputs: &[Value]) -> Result<Value, NNError> {
        if inputs.len() != self.weights.len() {
            return Err(NNError::InputSizeMismatch {
                expected: self.weights.len(),
                got: inputs.len(),
            });
        }
        let output = self
            .weights
            .iter()
            .zip(inputs.iter())
            .map(|(w, i)| w * i)
            .sum::<Value>();
        Ok(&output + &self.bias)
    }
}

/// A fully connected layer of a neural network
///
/// Neuron `r` owns row `r` of the weight matrix, so the weight has shape
/// `(n_outputs, n_inputs)` and the bias `(n_outputs,)`.
pub struct Layer {
    n_inputs: usize,
    neurons: Vec<Neuron>,
    n_output_nans: AtomicUsize,
}

impl Layer {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        Self::with_rng(n_inputs, n_outputs, &mut rand::rng())
    }

    /// Creates a new layer drawing its initial weights from `rng`
    pub fn with_rng<R: Rng + ?Sized>(n_inputs: usize, n_outputs: usize, rng: &mut R) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new(n_inputs, rng)).collect();
        Self::from_neurons(n_inputs, neurons)
    }

    fn from_neurons(n_inputs: usize, neurons: Vec<Neuron>) -> Self {
        Self {
            n_inputs,
            neurons,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new_ones(n_inputs)).collect();
        Self::from_neurons(n_inputs, neurons)
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.neurons.len()
    }

    /// Weight parameters in row-major order
    pub fn weights(&self) -> Vec<Value> {
        self.neurons
            .iter()
            .flat_map(|n| n.weights.iter().cloned())
            .collect()
    }

    pub fn biases(&self) -> Vec<Value> {
        self.neurons.iter().map(|n| n.bias.clone()).collect()
    }

    /// Returns all the parameters in the layer
    pub fn parameters(&self) -> Vec<Value> {
        self.neurons.iter().flat_map(|n| n.parameters()).collect()
    }

    /// Number of NaN outputs in the last forward pass
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }

    /// Computes forward pass for a layer
    pub fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let outputs = self
            .neurons
            .iter()
            .map(|n| n.forward(inputs))
            .collect::<Result<Vec<_>, _>>()?;
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if log::log_enabled!(log::Level::Debug) {
            let n_parameters_nans = self
                .parameters()
                .iter()
                .filter(|v| v.data().is_nan())
                .count();
            log::debug!(
                "n_output_nans: {}, n_parameters_nans: {}",
                n_output_nans,
                n_parameters_nans
            );
        }
        Ok(outputs)
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Takes the element-wise ReLU of the input values
    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        let n_dead_neurons = inputs.iter().filter(|v| v.data() <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        inputs.iter().map(|v| v.relu()).collect()
    }

    /// Returns the number of dead neurons in the layer (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

/// Zeroes each input with probability `p` while training
///
/// Kept values are scaled by `1 / (1 - p)` so the expected activation matches evaluation mode,
/// where dropout passes inputs through untouched. Masks are drawn from the layer's own rng,
/// so a dropout layer seeded through [`Dropout::with_rng`] replays the same masks.
pub struct Dropout {
    p: f32,
    training: bool,
    rng: RefCell<Pcg64Mcg>,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self, NNError> {
        Self::with_rng(p, &mut rand::rng())
    }

    /// Seeds the mask rng from `rng`
    pub fn with_rng<R: Rng + ?Sized>(p: f32, rng: &mut R) -> Result<Self, NNError> {
        if !(0.0..1.0).contains(&p) {
            return Err(NNError::InvalidArchitecture(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self {
            p,
            training: true,
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(rng.random())),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        if !self.training || self.p == 0.0 {
            return inputs.to_vec();
        }
        let mut rng = self.rng.borrow_mut();
        let scale = Value::new(1.0 / (1.0 - self.p));
        let dropped = Value::new(0.0);
        inputs
            .iter()
            .map(|v| {
                if rng.random::<f32>() < self.p {
                    v * &dropped
                } else {
                    v * &scale
                }
            })
            .collect()
    }
}

/// Applies softmax to a set of values
#[derive(Default)]
pub struct Softmax {}

impl Softmax {
    pub fn new() -> Self {
        Self {}
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        let exp_sum = inputs.iter().map(|v| v.exp()).sum::<Value>();
        inputs.iter().map(|v| &v.exp() / &exp_sum).collect()
    }
}

/// Log of the softmax, `x_i - log(sum_j exp(x_j))`
///
/// The maximum input is subtracted before exponentiating so large logits do not overflow.
/// It enters the graph as a constant; the log-sum-exp gradient does not depend on it.
#[derive(Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        let max = inputs
            .iter()
            .map(|v| v.data())
            .fold(f32::NEG_INFINITY, f32::max);
        let max = Value::new(if max.is_finite() { max } else { 0.0 });
        let log_sum_exp = &inputs
            .iter()
            .map(|v| (v - &max).exp())
            .sum::<Value>()
            .ln()
            + &max;
        inputs.iter().map(|v| v - &log_sum_exp).collect()
    }
}
