//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph.

use crate::values::Value;

/// The operation which produced a derived node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    ReLU,
    Exp,
    Ln,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::Pow => 2,
            BackpropFunc::Neg | BackpropFunc::ReLU | BackpropFunc::Exp | BackpropFunc::Ln => 1,
        }
    }
}

/// Represents backprop for the operation `in1 + in2 = out`
fn add(in1: &Value, in2: &Value, out_grad: f32) {
    in1.accumulate_grad(out_grad);
    in2.accumulate_grad(out_grad);
}

/// Represents backprop for the operation `in1 - in2 = out`
fn sub(in1: &Value, in2: &Value, out_grad: f32) {
    in1.accumulate_grad(out_grad);
    in2.accumulate_grad(-out_grad);
}

/// Represents backprop for the operation `in1 * in2 = out`
fn mul(in1: &Value, in2: &Value, out_grad: f32) {
    let (a, b) = (in1.data(), in2.data());
    in1.accumulate_grad(b * out_grad);
    in2.accumulate_grad(a * out_grad);
}

/// Represents backprop for the operation `in1 / in2 = out`
fn div(in1: &Value, in2: &Value, out_grad: f32) {
    let (a, b) = (in1.data(), in2.data());
    in1.accumulate_grad(out_grad / b);
    in2.accumulate_grad(-a * out_grad / (b * b));
}

/// Represents backprop for the operation `in1^in2 = out`
/// Exponents are treated as constants: d a^b / db is only defined for positive a
fn pow(in1: &Value, in2: &Value, out_grad: f32) {
    let (a, b) = (in1.data(), in2.data());
    in1.accumulate_grad(b * a.powf(b - 1.0) * out_grad);
}

/// Represents backprop for the operation `-in = out`
fn neg(in1: &Value, out_grad: f32) {
    in1.accumulate_grad(-out_grad);
}

/// Represents backprop for the operation `relu(in) = out`
fn relu(in1: &Value, out_grad: f32) {
    if in1.data() > 0.0 {
        in1.accumulate_grad(out_grad);
    }
}

/// Represents backprop for the operation `exp(in) = out`
fn exp(in1: &Value, out: &Value, out_grad: f32) {
    // d exp(x) / dx = exp(x), which is already stored in the output
    in1.accumulate_grad(out.data() * out_grad);
}

/// Represents backprop for the operation `ln(in) = out`
fn ln(in1: &Value, out_grad: f32) {
    in1.accumulate_grad(out_grad / in1.data());
}

/// Propagates the gradient of `out` into its operands
pub fn update_gradients(out: &Value, operands: &[Value]) {
    let Some(backprop_fn) = out.backprop_fn() else {
        return;
    };
    debug_assert_eq!(backprop_fn.n_operands(), operands.len());
    let out_grad = out.grad();
    match (backprop_fn, operands) {
        (BackpropFunc::Add, [a, b]) => add(a, b, out_grad),
        (BackpropFunc::Sub, [a, b]) => sub(a, b, out_grad),
        (BackpropFunc::Mul, [a, b]) => mul(a, b, out_grad),
        (BackpropFunc::Div, [a, b]) => div(a, b, out_grad),
        (BackpropFunc::Pow, [a, b]) => pow(a, b, out_grad),
        (BackpropFunc::Neg, [a]) => neg(a, out_grad),
        (BackpropFunc::ReLU, [a]) => relu(a, out_grad),
        (BackpropFunc::Exp, [a]) => exp(a, out, out_grad),
        (BackpropFunc::Ln, [a]) => ln(a, out_grad),
        (f, ops) => panic!("{:?} applied to {} operands", f, ops.len()),
    }
}
