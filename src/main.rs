//! Trains, evaluates and inspects feed-forward classifiers using the library provided by
//! `grad_mlp`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- train --dataset moon --hidden 16,16 --save moon.json
//! cargo run -- evaluate moon.json --dataset moon
//! cargo run -- inspect moon.json
//! ```
//!
//! Supports a few classic datasets out of the box and allows custom learning rate, momentum,
//! batch size, etc. Set `RUST_LOG=info` to follow training progress.

use std::{error::Error, path::PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use grad_mlp::{
    checkpoint::{self, Checkpoint},
    dataloader::DataLoader,
    datasets::{Dataset, load_dataset, split},
    model::{Architecture, Network},
    nn::Module,
    optim::{Adam, SGD},
    train::{TrainConfig, train, validate},
};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trains a new network and optionally saves it
    Train(TrainArgs),
    /// Reports loss and accuracy of a saved network on a fresh dataset
    Evaluate(EvaluateArgs),
    /// Prints the architecture and tensor shapes of a saved network
    Inspect { path: PathBuf },
}

#[derive(Args)]
struct DataArgs {
    #[clap(short, long, default_value_t = Dataset::XOR)]
    dataset: Dataset,
    #[clap(short, long, default_value_t = 1000)]
    class_size: usize,
    /// Seeds data generation, initialization, dropout and shuffling; random when omitted
    #[clap(short, long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,
    /// Hidden layer widths, comma separated
    // Note that when increasing the hidden size, activation values may explode if
    // the weights are not initialized properly
    #[clap(long, value_delimiter = ',', default_value = "16,16")]
    hidden: Vec<usize>,
    #[clap(short, long, default_value_t = 50)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 20)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.01)]
    lr: f32,
    #[clap(long, value_enum, default_value = "adam")]
    optimizer: OptimizerKind,
    /// Only used by SGD
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(long, default_value_t = 0.0)]
    dropout: f32,
    /// Validate every N optimizer steps, 0 to only validate at epoch ends
    #[clap(short, long, default_value_t = 40)]
    print_every: usize,
    /// Where to write the trained network
    #[clap(long)]
    save: Option<PathBuf>,
}

#[derive(Args)]
struct EvaluateArgs {
    path: PathBuf,
    #[command(flatten)]
    data: DataArgs,
    #[clap(short, long, default_value_t = 100)]
    batch_size: usize,
}

fn seeded_rng(seed: Option<u64>) -> Pcg64Mcg {
    let seed = seed.unwrap_or_else(rand::random);
    log::info!("Using seed {}", seed);
    Pcg64Mcg::seed_from_u64(seed)
}

fn run_train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let mut rng = seeded_rng(args.data.seed);
    let dataset = args.data.dataset;
    let samples = load_dataset(dataset, args.data.class_size, &mut rng);
    let ((train_x, train_y), (valid_x, valid_y)) = split(samples, 0.2, &mut rng);
    let train_loader = DataLoader::new(train_x, train_y, args.batch_size, true)?;
    let valid_loader = DataLoader::new(valid_x, valid_y, args.batch_size, false)?;
    log::info!(
        "Dataset {}: {} training and {} validation samples",
        dataset,
        train_loader.len(),
        valid_loader.len()
    );

    let architecture = Architecture::new(dataset.input_size(), dataset.n_classes(), args.hidden)?;
    let mut model = Network::with_rng(architecture, args.dropout, &mut rng)?;
    let config = TrainConfig {
        epochs: args.epochs,
        print_every: args.print_every,
        seed: Some(rng.random()),
    };

    let stats = match args.optimizer {
        OptimizerKind::Sgd => {
            let mut optim = SGD::new(model.parameters(), args.lr, args.momentum);
            train(&mut model, &train_loader, &valid_loader, &mut optim, &config)?
        }
        OptimizerKind::Adam => {
            let mut optim = Adam::new(model.parameters(), args.lr);
            train(&mut model, &train_loader, &valid_loader, &mut optim, &config)?
        }
    };
    if let Some(last) = stats.last() {
        println!(
            "after {} epochs: train_loss {:.4}, valid_loss {:.4}, accuracy {:.3}",
            last.epoch, last.train_loss, last.valid_loss, last.accuracy
        );
    }

    if let Some(path) = args.save {
        model.eval();
        checkpoint::save(&model, &path)?;
        println!("saved to {}", path.display());
    }
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<(), Box<dyn Error>> {
    let mut model = checkpoint::load(&args.path)?;
    let mut rng = seeded_rng(args.data.seed);
    let (data, labels) = load_dataset(args.data.dataset, args.data.class_size, &mut rng);
    let loader = DataLoader::new(data, labels, args.batch_size, false)?;
    let (loss, accuracy) = validate(&mut model, &loader)?;
    println!(
        "{} on {} {} samples: loss {:.4}, accuracy {:.3}",
        args.path.display(),
        loader.len(),
        args.data.dataset,
        loss,
        accuracy
    );
    Ok(())
}

fn run_inspect(path: PathBuf) -> Result<(), Box<dyn Error>> {
    let checkpoint = Checkpoint::load(&path)?;
    let architecture = &checkpoint.architecture;
    println!("{}", path.display());
    println!("  input_size:   {}", architecture.input_size());
    println!("  output_size:  {}", architecture.output_size());
    println!("  hidden_sizes: {:?}", architecture.hidden_sizes());
    let mut n_parameters = 0;
    for (name, tensor) in &checkpoint.state_dict {
        println!("  {:<20} {:?}", name, tensor.shape);
        n_parameters += tensor.data.len();
    }
    println!("  {} parameters", n_parameters);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Cli::parse().command {
        Command::Train(args) => run_train(args),
        Command::Evaluate(args) => run_evaluate(args),
        Command::Inspect { path } => run_inspect(path),
    }
}
