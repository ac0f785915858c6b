//! Generates 2-D binary classification datasets
//!
//! Every generator returns `(inputs, labels)` with one class index per input.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
};

use clap::ValueEnum;
use rand::{Rng, seq::SliceRandom};

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Line,
    Circle,
    XOR,
    Moon,
}

impl Dataset {
    /// Every dataset has two classes
    pub fn n_classes(&self) -> usize {
        2
    }

    /// Every dataset lives in the plane
    pub fn input_size(&self) -> usize {
        2
    }
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::XOR => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
        }
    }
}

pub type Samples = (Vec<Vec<f32>>, Vec<usize>);

/// Loads a dataset based on the dataset type
pub fn load_dataset<R: Rng + ?Sized>(dataset: Dataset, class_size: usize, rng: &mut R) -> Samples {
    match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::XOR => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
    }
}

/// Generates a simple linearly separable dataset of `class_size` points
pub fn gen_linear_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x > y { 0 } else { 1 });
    }

    (data, labels)
}

/// Generates two concentric rings, `class_size` points each
pub fn gen_circle_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (label, radius) in [(0, 3.0f32), (1, 5.0f32)] {
        for _ in 0..class_size {
            let angle: f32 = rng.random_range(0.0..2.0 * PI);
            let jitter: f32 = rng.random_range(-0.25..0.25);
            let radius = radius + radius * jitter;
            data.push(vec![radius * angle.cos(), radius * angle.sin()]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Points in the square, labelled by whether both coordinates share a sign
pub fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push(vec![x, y]);
        labels.push(if x * y > 0.0 { 0 } else { 1 });
    }

    (data, labels)
}

/// Generates a moons dataset (two interleaving partial circles), `class_size` points each
pub fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0f32;

    for label in [0, 1] {
        for _ in 0..class_size {
            let theta: f32 = rng.random_range(-PI / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if label == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x: f32 = rng.random_range(-0.1..0.1);
            let noise_y: f32 = rng.random_range(-0.1..0.1);
            data.push(vec![x + noise_x, y + noise_y]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Shuffles the samples and splits off `fraction` of them, e.g. for validation.
///
/// Generators emit one class after the other, so splitting without the shuffle would not
/// give a representative holdout.
pub fn split<R: Rng + ?Sized>(samples: Samples, fraction: f32, rng: &mut R) -> (Samples, Samples) {
    let (data, labels) = samples;
    let mut pairs = data.into_iter().zip(labels).collect::<Vec<_>>();
    pairs.shuffle(rng);
    let n_tail = ((pairs.len() as f32) * fraction).round() as usize;
    let at = pairs.len() - n_tail.min(pairs.len());
    let tail = pairs.split_off(at);
    (pairs.into_iter().unzip(), tail.into_iter().unzip())
}
