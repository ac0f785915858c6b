//! Feed-forward classifier built from an architecture descriptor

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    nn::{Dropout, Layer, LogSoftmax, Module, NNError, ReLU},
    state::{ShapeMismatch, StateDict, Tensor, compare_shapes},
    values::Value,
};

/// The integers needed to rebuild a network's layer topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    input_size: usize,
    output_size: usize,
    hidden_sizes: Vec<usize>,
}

impl Architecture {
    pub fn new(
        input_size: usize,
        output_size: usize,
        hidden_sizes: Vec<usize>,
    ) -> Result<Self, NNError> {
        let architecture = Self {
            input_size,
            output_size,
            hidden_sizes,
        };
        architecture.validate()?;
        Ok(architecture)
    }

    /// Checks every size is positive. Deserialized descriptors bypass `new`, so loaders call this.
    pub fn validate(&self) -> Result<(), NNError> {
        if self.input_size == 0 {
            return Err(NNError::InvalidArchitecture("input_size must be > 0".into()));
        }
        if self.output_size == 0 {
            return Err(NNError::InvalidArchitecture(
                "output_size must be > 0".into(),
            ));
        }
        if let Some(i) = self.hidden_sizes.iter().position(|&w| w == 0) {
            return Err(NNError::InvalidArchitecture(format!(
                "hidden_sizes[{}] must be > 0",
                i
            )));
        }
        Ok(())
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn hidden_sizes(&self) -> &[usize] {
        &self.hidden_sizes
    }

    /// Layer widths from input to output
    pub fn widths(&self) -> Vec<usize> {
        std::iter::once(self.input_size)
            .chain(self.hidden_sizes.iter().copied())
            .chain(std::iter::once(self.output_size))
            .collect()
    }

    /// Layer identifiers in forward order: `hidden_0`, `hidden_1`, ..., `output`
    pub fn layer_names(&self) -> Vec<String> {
        (0..self.hidden_sizes.len())
            .map(|i| format!("hidden_{}", i))
            .chain(std::iter::once("output".to_string()))
            .collect()
    }

    /// Parameter names and the shapes this architecture implies for them, in forward order
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let widths = self.widths();
        self.layer_names()
            .into_iter()
            .zip(widths.windows(2))
            .flat_map(|(layer, w)| {
                [
                    (format!("{}_weight", layer), vec![w[1], w[0]]),
                    (format!("{}_bias", layer), vec![w[1]]),
                ]
            })
            .collect()
    }
}

/// A trainable parameter tensor together with its graph values
pub struct NamedParameter {
    pub name: String,
    pub shape: Vec<usize>,
    /// row-major
    pub values: Vec<Value>,
}

/// Classifier with ReLU + dropout hidden layers and a log-softmax output
///
/// `forward` returns log-probabilities, to be paired with [`crate::loss::NLLLoss`].
pub struct Network {
    architecture: Architecture,
    hidden: Vec<Layer>,
    activations: Vec<ReLU>,
    dropout: Dropout,
    output: Layer,
    log_softmax: LogSoftmax,
}

impl Network {
    /// Builds a network without dropout, initialized from the thread-local rng
    pub fn new(architecture: Architecture) -> Result<Self, NNError> {
        Self::with_rng(architecture, 0.0, &mut rand::rng())
    }

    /// Builds a network, drawing initial parameters and the dropout seed from `rng`
    pub fn with_rng<R: Rng + ?Sized>(
        architecture: Architecture,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self, NNError> {
        architecture.validate()?;
        let widths = architecture.widths();
        let n_layers = widths.len() - 1;
        let mut layers = widths
            .windows(2)
            .map(|w| Layer::with_rng(w[0], w[1], rng))
            .collect::<Vec<_>>();
        let output = layers.remove(n_layers - 1);
        let activations = (0..layers.len()).map(|_| ReLU::new()).collect();
        Ok(Self {
            architecture,
            hidden: layers,
            activations,
            dropout: Dropout::with_rng(dropout, rng)?,
            output,
            log_softmax: LogSoftmax::new(),
        })
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    /// Enables dropout
    pub fn train(&mut self) {
        self.dropout.set_training(true);
    }

    /// Disables dropout
    pub fn eval(&mut self) {
        self.dropout.set_training(false);
    }

    /// Layers in forward order with their identifiers
    fn layers(&self) -> impl Iterator<Item = (String, &Layer)> {
        self.architecture
            .layer_names()
            .into_iter()
            .zip(self.hidden.iter().chain(std::iter::once(&self.output)))
    }

    /// Total number of dead ReLU units over all hidden layers in the last forward pass
    pub fn n_dead_neurons(&self) -> usize {
        self.activations.iter().map(|r| r.n_dead_neurons()).sum()
    }

    /// NaN outputs over all layers in the last forward pass
    pub fn n_output_nans(&self) -> usize {
        self.hidden
            .iter()
            .chain(std::iter::once(&self.output))
            .map(|l| l.n_output_nans())
            .sum()
    }

    pub fn named_parameters(&self) -> Vec<NamedParameter> {
        self.layers()
            .flat_map(|(name, layer)| {
                [
                    NamedParameter {
                        name: format!("{}_weight", name),
                        shape: vec![layer.n_outputs(), layer.n_inputs()],
                        values: layer.weights(),
                    },
                    NamedParameter {
                        name: format!("{}_bias", name),
                        shape: vec![layer.n_outputs()],
                        values: layer.biases(),
                    },
                ]
            })
            .collect()
    }

    /// A deep copy of the current parameter values
    pub fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|p| {
                let data = p.values.iter().map(|v| v.data()).collect();
                (p.name, Tensor::new(p.shape, data))
            })
            .collect()
    }

    /// Copies every tensor of `state_dict` onto the matching parameter.
    ///
    /// All entries are checked before anything is written: on error the network is untouched
    /// and the error lists every mismatched, missing and unexpected entry.
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<(), ShapeMismatch> {
        let parameters = self.named_parameters();
        compare_shapes(
            parameters.iter().map(|p| (p.name.as_str(), p.shape.clone())),
            state_dict,
        )?;
        for parameter in parameters {
            let tensor = &state_dict[&parameter.name];
            for (mut value, &data) in parameter.values.into_iter().zip(tensor.data.iter()) {
                value.set_data(data);
            }
        }
        log::debug!("loaded {} tensors into network", state_dict.len());
        Ok(())
    }

    fn forward_inner(&self, inputs: &[Value], dropout: bool) -> Result<Vec<Value>, NNError> {
        let mut x = inputs.to_vec();
        for (layer, relu) in self.hidden.iter().zip(self.activations.iter()) {
            x = relu.forward(&layer.forward(&x)?);
            if dropout {
                x = self.dropout.forward(&x);
            }
        }
        let logits = self.output.forward(&x)?;
        Ok(self.log_softmax.forward(&logits))
    }

    /// Class probabilities for a single input, with dropout disabled
    pub fn predict(&self, input: &[f32]) -> Result<Vec<f32>, NNError> {
        let inputs = input.iter().map(|&v| Value::new(v)).collect::<Vec<_>>();
        let log_probs = self.forward_inner(&inputs, false)?;
        Ok(log_probs.iter().map(|v| v.data().exp()).collect())
    }

    /// Index of the most probable class
    pub fn classify(&self, input: &[f32]) -> Result<usize, NNError> {
        let probs = self.predict(input)?;
        Ok(argmax(&probs))
    }
}

/// Index of the largest value, the first one on ties
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max { (i, v) } else { (best, max) }
        })
        .0
}

impl Module for Network {
    fn parameters(&self) -> Vec<Value> {
        self.hidden
            .iter()
            .chain(std::iter::once(&self.output))
            .flat_map(|l| l.parameters())
            .collect()
    }

    /// Log-probabilities for a single input; dropout applies while in training mode
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        self.forward_inner(inputs, true)
    }
}
