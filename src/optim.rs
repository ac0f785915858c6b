//! Optimizer(s)

use crate::values::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

fn zero_grads(params: &mut [Value]) {
    for param in params.iter_mut() {
        param.zero_grad();
    }
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Value>,
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32, momentum: f32) -> Self {
        let velocity = vec![0.0; params.len()];
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter_mut().zip(self.velocity.iter_mut()) {
            *velocity = self.momentum * *velocity - self.lr * param.grad();
            let new_val = param.data() + *velocity;
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }
}

/// Adam, with bias-corrected first and second moment estimates
/// <https://pytorch.org/docs/stable/generated/torch.optim.Adam.html>
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    // number of steps taken, used for bias correction
    t: i32,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    /// Adam with the usual defaults, `beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8`
    pub fn new(params: Vec<Value>, lr: f32) -> Self {
        Self::with_betas(params, lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(params: Vec<Value>, lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        for ((param, m), v) in self
            .params
            .iter_mut()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let grad = param.grad();
            *m = self.beta1 * *m + (1.0 - self.beta1) * grad;
            *v = self.beta2 * *v + (1.0 - self.beta2) * grad * grad;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        zero_grads(&mut self.params);
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_sgd_no_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone(), c.clone()], 0.1, 0.0);
        optim.step();
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
        assert_eq!(c.grad(), 1.0);
        assert_eq!(a.data(), 0.9);
        assert_eq!(b.data(), 1.9);
        assert_eq!(c.data(), 2.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone(), c.clone()], 0.1, 0.9);
        optim.step();
        assert_eq!(a.data(), 0.9);
        assert_eq!(b.data(), 1.9);
        assert_eq!(c.data(), 2.9);
        assert_eq!(optim.velocities(), &[-0.1, -0.1, -0.1]);
        optim.step();
        assert_eq!(a.data(), 0.71);
        assert_eq!(b.data(), 1.71);
        assert_eq!(c.data(), 2.71);
        assert_eq!(optim.velocities(), &[-0.19, -0.19, -0.19]);
    }

    #[test]
    fn test_zero_grad() {
        let a = Value::new(1.0);
        let b = &a * &Value::new(3.0);
        b.backward();
        assert_eq!(a.grad(), 3.0);

        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.0);
        optim.zero_grad();
        assert_eq!(a.grad(), 0.0);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        // with bias correction the first step is lr * g / |g| regardless of the gradient scale
        let a = Value::new(1.0);
        let b = Value::new(-2.0);
        let loss = &(&a * &Value::new(5.0)) + &(&b * &Value::new(-0.01));
        loss.backward();

        let mut optim = Adam::new(vec![a.clone(), b.clone()], 0.1);
        optim.step();
        assert_eq_float!(a.data(), 0.9, 1e-5);
        assert_eq_float!(b.data(), -1.9, 1e-5);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let x = Value::new(3.0);
        let mut optim = Adam::new(vec![x.clone()], 0.1);
        for _ in 0..200 {
            optim.zero_grad();
            let loss = x.pow(&Value::new(2.0));
            loss.backward();
            optim.step();
        }
        assert!(x.data().abs() < 0.1, "x = {}", x.data());
    }
}
