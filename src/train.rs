//! Training and validation loops

use rand::{SeedableRng, rngs::ThreadRng};
use rand_pcg::Pcg64Mcg;

use crate::{
    dataloader::{DataLoader, DataLoaderIterator},
    loss::NLLLoss,
    model::{Network, argmax},
    nn::{Module, NNError},
    optim::Optim,
    values::Value,
};

/// Hyperparameters of a training run which are not owned by the optimizer
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    /// Validate and log every `print_every` optimizer steps
    pub print_every: usize,
    /// Seeds the batch shuffling; `None` uses the thread rng
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            print_every: 40,
            seed: None,
        }
    }
}

/// Summary of one completed epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// 1-based
    pub epoch: usize,
    /// mean of the batch losses
    pub train_loss: f32,
    pub valid_loss: f32,
    pub accuracy: f32,
}

enum ShuffleRng {
    Seeded(Pcg64Mcg),
    Thread(ThreadRng),
}

impl ShuffleRng {
    fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => ShuffleRng::Seeded(Pcg64Mcg::seed_from_u64(seed)),
            None => ShuffleRng::Thread(rand::rng()),
        }
    }

    fn iter<'a>(&mut self, loader: &'a DataLoader) -> DataLoaderIterator<'a> {
        match self {
            ShuffleRng::Seeded(rng) => loader.iter_with(rng),
            ShuffleRng::Thread(rng) => loader.iter_with(rng),
        }
    }
}

/// Mean NLL loss and accuracy over `loader`, with dropout disabled.
///
/// Leaves the network in evaluation mode.
pub fn validate(model: &mut Network, loader: &DataLoader) -> Result<(f32, f32), NNError> {
    model.eval();
    let mut total_loss = 0.0;
    let mut n_correct = 0;
    let mut n_seen = 0;
    for batch in loader.iter() {
        for (inputs, label) in batch {
            let log_probs = model.forward(inputs)?;
            total_loss += NLLLoss::call(&log_probs, label)?.data();
            let scores = log_probs.iter().map(|v| v.data()).collect::<Vec<_>>();
            if argmax(&scores) == label {
                n_correct += 1;
            }
            n_seen += 1;
        }
    }
    if n_seen == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((
        total_loss / n_seen as f32,
        n_correct as f32 / n_seen as f32,
    ))
}

/// Trains `model` with mini-batch gradient descent.
///
/// For every batch: reset gradients, run forward and backward for each sample with its loss
/// scaled by `1 / batch_len` so the accumulated gradient is the batch mean, then take one
/// optimizer step. The model is validated every `config.print_every` steps and at the end
/// of every epoch, and is left in training mode.
pub fn train<O: Optim>(
    model: &mut Network,
    train_loader: &DataLoader,
    valid_loader: &DataLoader,
    optim: &mut O,
    config: &TrainConfig,
) -> Result<Vec<EpochStats>, NNError> {
    let mut rng = ShuffleRng::new(config.seed);
    let mut stats = Vec::with_capacity(config.epochs);
    let mut steps = 0;
    let mut running_loss = 0.0;

    model.train();
    for epoch in 1..=config.epochs {
        let mut epoch_loss = 0.0;
        let mut n_batches = 0;
        let mut total_n_dead_neurons = 0;
        let mut total_n_output_nans = 0;

        for batch in rng.iter(train_loader) {
            optim.zero_grad();
            let scale = Value::new(1.0 / batch.len() as f32);
            let mut batch_loss = 0.0;
            for (inputs, label) in batch {
                // the sample's graph is freed at the end of the iteration; only the
                // gradients accumulated on the parameters survive
                let log_probs = model.forward(inputs)?;
                let loss = &NLLLoss::call(&log_probs, label)? * &scale;
                loss.backward();
                batch_loss += loss.data();
                total_n_dead_neurons += model.n_dead_neurons();
                total_n_output_nans += model.n_output_nans();
            }
            optim.step();

            steps += 1;
            n_batches += 1;
            epoch_loss += batch_loss;
            running_loss += batch_loss;

            if config.print_every > 0 && steps % config.print_every == 0 {
                let (valid_loss, accuracy) = validate(model, valid_loader)?;
                log::info!(
                    "epoch: {}/{}, step: {}, training loss: {:.3}, validation loss: {:.3}, accuracy: {:.3}",
                    epoch,
                    config.epochs,
                    steps,
                    running_loss / config.print_every as f32,
                    valid_loss,
                    accuracy
                );
                running_loss = 0.0;
                model.train();
            }
        }

        log::debug!(
            "Average n_dead_neurons in epoch {}: {}",
            epoch,
            total_n_dead_neurons / train_loader.len().max(1)
        );
        if total_n_output_nans > 0 {
            log::warn!(
                "epoch {}: {} NaN layer outputs, training has likely diverged",
                epoch,
                total_n_output_nans
            );
        }
        let (valid_loss, accuracy) = validate(model, valid_loader)?;
        model.train();
        let train_loss = if n_batches > 0 {
            epoch_loss / n_batches as f32
        } else {
            0.0
        };
        log::info!(
            "epoch: {}, train_loss: {:.4}, valid_loss: {:.4}, accuracy: {:.3}",
            epoch,
            train_loss,
            valid_loss,
            accuracy
        );
        stats.push(EpochStats {
            epoch,
            train_loss,
            valid_loss,
            accuracy,
        });
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use crate::{
        datasets::{gen_linear_data, split},
        model::Architecture,
        optim::{Adam, SGD},
    };

    use super::*;

    fn loaders(seed: u64) -> (DataLoader, DataLoader) {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let samples = gen_linear_data(200, &mut rng);
        let ((train_x, train_y), (valid_x, valid_y)) = split(samples, 0.25, &mut rng);
        (
            DataLoader::new(train_x, train_y, 10, true).unwrap(),
            DataLoader::new(valid_x, valid_y, 10, false).unwrap(),
        )
    }

    fn network(seed: u64) -> Network {
        let arch = Architecture::new(2, 2, vec![8]).unwrap();
        Network::with_rng(arch, 0.0, &mut Pcg64Mcg::seed_from_u64(seed)).unwrap()
    }

    #[test]
    fn test_train_reduces_loss() {
        let (train_loader, valid_loader) = loaders(0);
        let mut model = network(1);
        let mut optim = Adam::new(model.parameters(), 0.02);
        let config = TrainConfig {
            epochs: 15,
            print_every: 5,
            seed: Some(2),
        };

        let stats = train(&mut model, &train_loader, &valid_loader, &mut optim, &config).unwrap();
        assert_eq!(stats.len(), 15);
        assert_eq!(stats[14].epoch, 15);
        assert!(stats[14].train_loss < stats[0].train_loss);
        assert!(stats[14].accuracy > 0.85, "accuracy {}", stats[14].accuracy);
    }

    #[test]
    fn test_train_with_sgd_changes_parameters() {
        let (train_loader, valid_loader) = loaders(3);
        let mut model = network(4);
        let before = model.state_dict();
        let mut optim = SGD::new(model.parameters(), 0.05, 0.9);
        let config = TrainConfig {
            epochs: 1,
            print_every: 0,
            seed: Some(5),
        };

        train(&mut model, &train_loader, &valid_loader, &mut optim, &config).unwrap();
        assert_ne!(model.state_dict(), before);
        // the optimizer steps on the very values the network owns
        assert_eq!(model.state_dict().len(), before.len());
    }

    #[test]
    fn test_validate() {
        let (_, valid_loader) = loaders(6);
        let mut model = network(7);
        let (loss, accuracy) = validate(&mut model, &valid_loader).unwrap();
        assert!(loss > 0.0);
        assert!((0.0..=1.0).contains(&accuracy));

        let empty = DataLoader::new(vec![], vec![], 4, false).unwrap();
        assert_eq!(validate(&mut model, &empty).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_wrong_input_width_is_an_error() {
        let loader = DataLoader::new(vec![vec![1.0, 2.0, 3.0]], vec![0], 1, false).unwrap();
        let mut model = network(8);
        let mut optim = SGD::new(model.parameters(), 0.1, 0.0);
        let result = train(
            &mut model,
            &loader,
            &loader,
            &mut optim,
            &TrainConfig::default(),
        );
        assert!(matches!(
            result,
            Err(NNError::InputSizeMismatch {
                expected: 2,
                got: 3
            })
        ));
    }
}
