//! Loss function(s)

use crate::{nn::NNError, values::Value};

/// Mean Squared Error Loss between two vectors of values
pub struct MSELoss;

impl MSELoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let loss = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(a, b)| (a.as_ref() - b.as_ref()).pow(&Value::new(2.0)))
            .sum::<Value>();
        loss / Value::new(y_pred.len() as f32)
    }
}

/// Negative log likelihood of the target class, given log-probabilities
///
/// Paired with a log-softmax output this is the cross entropy loss.
/// <https://pytorch.org/docs/stable/generated/torch.nn.NLLLoss.html>
pub struct NLLLoss;

impl NLLLoss {
    pub fn call<T: AsRef<Value>>(log_probs: &[T], target: usize) -> Result<Value, NNError> {
        let log_prob = log_probs
            .get(target)
            .ok_or(NNError::TargetOutOfRange {
                target,
                n_classes: log_probs.len(),
            })?;
        Ok(-log_prob.as_ref())
    }
}
