//! A minimal library for building, training and checkpointing feed-forward
//! classifiers using a PyTorch-like API.
//!
//! Networks are described by an [`model::Architecture`], trained with the scalar autograd
//! engine in [`values`], and persisted with [`checkpoint`] as the architecture plus a
//! state dict of named parameter tensors.

pub mod backprop_fns;
pub mod checkpoint;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod model;
pub mod nn;
pub mod optim;
pub mod state;
pub mod train;
pub mod values;
