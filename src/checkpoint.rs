//! Saving and loading trained networks
//!
//! A checkpoint pairs the [`Architecture`] a network was built from with a deep copy of its
//! parameters. Loading rebuilds the network from the architecture, then checks every stored
//! tensor against the shapes that architecture implies before copying any value, so a
//! network is either fully restored or left untouched.
//!
//! On disk a checkpoint is pretty-printed JSON:
//!
//! ```json
//! {
//!   "input_size": 784,
//!   "output_size": 10,
//!   "hidden_sizes": [512, 256, 128],
//!   "state_dict": {
//!     "hidden_0_bias": { "shape": [512], "data": [0.01, ...] },
//!     ...
//!   }
//! }
//! ```
//!
//! JSON has no NaN or infinity; such parameters are stored as the strings `"NaN"`, `"inf"`
//! and `"-inf"`.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    model::{Architecture, Network},
    nn::NNError,
    state::{ShapeMismatch, StateDict, compare_shapes},
};

/// Why a checkpoint could not be turned back into a record
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[source] NNError),
    #[error("tensor {name} declares shape {shape:?} whose size overflows")]
    ShapeOverflow { name: String, shape: Vec<usize> },
    #[error("tensor {name} declares shape {shape:?} ({expected} values) but holds {actual} values")]
    TensorLength {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// Errors for saving and loading checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The destination could not be written
    #[error("could not write checkpoint to {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    /// The source could not be read, or does not hold a well-formed checkpoint
    #[error("could not read checkpoint from {origin}: {source}")]
    Format { origin: String, source: FormatError },
    /// The stored parameters do not fit the architecture they are loaded into
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),
}

impl CheckpointError {
    fn write(path: &Path, source: io::Error) -> Self {
        CheckpointError::Write {
            path: path.to_path_buf(),
            source,
        }
    }

    fn format(origin: &Path, source: impl Into<FormatError>) -> Self {
        CheckpointError::Format {
            origin: origin.display().to_string(),
            source: source.into(),
        }
    }
}

/// Architecture descriptor plus parameters of a network, detached from the network itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(flatten)]
    pub architecture: Architecture,
    pub state_dict: StateDict,
}

impl Checkpoint {
    /// Snapshots the architecture and current parameter values of `model`
    pub fn from_model(model: &Network) -> Self {
        Self {
            architecture: model.architecture().clone(),
            state_dict: model.state_dict(),
        }
    }

    /// Checks what can be checked without building a network: the descriptor is usable and
    /// every tensor's data fills its declared shape
    pub fn validate(&self) -> Result<(), FormatError> {
        self.architecture
            .validate()
            .map_err(FormatError::Descriptor)?;
        for (name, tensor) in &self.state_dict {
            match tensor.numel() {
                None => {
                    return Err(FormatError::ShapeOverflow {
                        name: name.clone(),
                        shape: tensor.shape.clone(),
                    });
                }
                Some(expected) if expected != tensor.data.len() => {
                    return Err(FormatError::TensorLength {
                        name: name.clone(),
                        shape: tensor.shape.clone(),
                        expected,
                        actual: tensor.data.len(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Serializes the checkpoint to any writer, e.g. an in-memory buffer bound for a blob store
    pub fn write_to<W: Write>(&self, writer: W) -> io::Result<()> {
        serde_json::to_writer_pretty(writer, self).map_err(io::Error::from)
    }

    /// Reads and validates a checkpoint from any reader
    pub fn read_from<R: Read>(reader: R) -> Result<Self, FormatError> {
        let checkpoint: Checkpoint = serde_json::from_reader(reader)?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// Writes the checkpoint to `path`, replacing any existing file.
    ///
    /// Parent directories are not created.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| CheckpointError::write(path, e))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)
            .and_then(|_| writer.flush())
            .map_err(|e| CheckpointError::write(path, e))?;
        log::info!(
            "Saved checkpoint ({} tensors) to '{}'",
            self.state_dict.len(),
            path.display()
        );
        Ok(())
    }

    /// Reads and validates the checkpoint stored at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| CheckpointError::format(path, e))?;
        let checkpoint = Self::read_from(BufReader::new(file))
            .map_err(|e| CheckpointError::format(path, e))?;
        log::debug!(
            "Read checkpoint '{}': {:?}",
            path.display(),
            checkpoint.architecture
        );
        Ok(checkpoint)
    }

    /// Builds a network from the descriptor and fills it with the stored parameters.
    ///
    /// The stored tensors are checked against the descriptor before the network is
    /// allocated, so a descriptor far larger than its data fails without building anything.
    pub fn into_model(self) -> Result<Network, CheckpointError> {
        let shapes = self.architecture.parameter_shapes();
        compare_shapes(
            shapes.iter().map(|(name, shape)| (name.as_str(), shape.clone())),
            &self.state_dict,
        )?;
        let mut model = Network::new(self.architecture).map_err(|e| {
            CheckpointError::Format {
                origin: "record".to_string(),
                source: FormatError::Descriptor(e),
            }
        })?;
        model.load_state_dict(&self.state_dict)?;
        Ok(model)
    }

    /// Copies the stored parameters onto an existing network built by the caller
    pub fn apply_to(&self, model: &mut Network) -> Result<(), CheckpointError> {
        model.load_state_dict(&self.state_dict)?;
        Ok(())
    }
}

/// Saves `model` to `path` and returns the record that was written
pub fn save(model: &Network, path: impl AsRef<Path>) -> Result<Checkpoint, CheckpointError> {
    let checkpoint = Checkpoint::from_model(model);
    checkpoint.save(path)?;
    Ok(checkpoint)
}

/// Rebuilds the network stored at `path`
pub fn load(path: impl AsRef<Path>) -> Result<Network, CheckpointError> {
    let path = path.as_ref();
    let model = Checkpoint::load(path)?.into_model()?;
    log::info!("Loaded checkpoint '{}'", path.display());
    Ok(model)
}

/// Loads the parameters stored at `path` into `model`, whose architecture the caller chose.
///
/// Every stored tensor whose shape disagrees with `model` is reported at once; `model` is only
/// modified when all of them fit.
pub fn load_into(model: &mut Network, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    let path = path.as_ref();
    let checkpoint = Checkpoint::load(path)?;
    if &checkpoint.architecture != model.architecture() {
        log::warn!(
            "Checkpoint '{}' was saved from {:?}, loading into {:?}",
            path.display(),
            checkpoint.architecture,
            model.architecture()
        );
    }
    checkpoint.apply_to(model)?;
    log::info!("Loaded checkpoint '{}' into existing network", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;
    use tempfile::tempdir;

    use crate::{state::Mismatch, state::Tensor};

    use super::*;

    fn network(arch: Architecture, seed: u64) -> Network {
        Network::with_rng(arch, 0.0, &mut Pcg64Mcg::seed_from_u64(seed)).unwrap()
    }

    fn bits(model: &Network) -> Vec<(String, Vec<u32>)> {
        model
            .state_dict()
            .into_iter()
            .map(|(name, t)| (name, t.data.iter().map(|v| v.to_bits()).collect()))
            .collect()
    }

    #[test]
    fn test_save_load_is_bit_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let model = network(Architecture::new(4, 3, vec![6, 5]).unwrap(), 1);

        let record = save(&model, &path).unwrap();
        assert_eq!(&record.architecture, model.architecture());

        let restored = load(&path).unwrap();
        assert_eq!(restored.architecture(), model.architecture());
        assert_eq!(bits(&restored), bits(&model));
        assert_eq!(
            restored.predict(&[0.1, -0.2, 0.3, 0.4]).unwrap(),
            model.predict(&[0.1, -0.2, 0.3, 0.4]).unwrap()
        );
    }

    #[test]
    fn test_load_then_save_reproduces_the_record() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        let model = network(Architecture::new(3, 2, vec![4]).unwrap(), 2);
        save(&model, &first).unwrap();

        save(&load(&first).unwrap(), &second).unwrap();
        assert_eq!(
            Checkpoint::load(&first).unwrap(),
            Checkpoint::load(&second).unwrap()
        );
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn test_record_is_detached_from_model() {
        let model = network(Architecture::new(2, 2, vec![]).unwrap(), 3);
        let record = Checkpoint::from_model(&model);
        let mut first = crate::nn::Module::parameters(&model)[0].clone();
        first.set_data(100.0);
        assert_ne!(record.state_dict["output_weight"].data[0], 100.0);
    }

    #[test]
    fn test_json_layout() {
        let model = network(Architecture::new(3, 2, vec![4]).unwrap(), 4);
        let mut buffer = vec![];
        Checkpoint::from_model(&model).write_to(&mut buffer).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(json["input_size"], 3);
        assert_eq!(json["output_size"], 2);
        assert_eq!(json["hidden_sizes"], serde_json::json!([4]));
        let state_dict = json["state_dict"].as_object().unwrap();
        let mut keys = state_dict.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(
            keys,
            vec!["hidden_0_bias", "hidden_0_weight", "output_bias", "output_weight"]
        );
        assert_eq!(
            state_dict["hidden_0_weight"]["shape"],
            serde_json::json!([4, 3])
        );

        let restored = Checkpoint::read_from(buffer.as_slice()).unwrap();
        assert_eq!(restored, Checkpoint::from_model(&model));
    }

    #[test]
    fn test_unwritable_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("model.json");
        let model = network(Architecture::new(2, 2, vec![2]).unwrap(), 5);
        let err = save(&model, &path).unwrap_err();
        assert!(matches!(err, CheckpointError::Write { .. }), "{}", err);
        assert!(err.to_string().contains("model.json"));
    }

    #[test]
    fn test_missing_file_is_a_format_error() {
        let dir = tempdir().unwrap();
        let err = load(dir.path().join("nope.json")).err().unwrap();
        assert!(matches!(
            err,
            CheckpointError::Format {
                source: FormatError::Io(_),
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_record_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let model = network(Architecture::new(3, 2, vec![4]).unwrap(), 6);
        save(&model, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = load(&path).err().unwrap();
        assert!(matches!(
            err,
            CheckpointError::Format {
                source: FormatError::Json(_),
                ..
            }
        ));

        // the caller's network is not touched by a failed load
        let mut target = network(Architecture::new(3, 2, vec![4]).unwrap(), 7);
        let before = bits(&target);
        assert!(load_into(&mut target, &path).is_err());
        assert_eq!(bits(&target), before);
    }

    #[test]
    fn test_garbage_and_missing_fields_are_format_errors() {
        assert!(matches!(
            Checkpoint::read_from("not json".as_bytes()),
            Err(FormatError::Json(_))
        ));
        let missing_sizes = r#"{"input_size": 2, "output_size": 2, "state_dict": {}}"#;
        assert!(matches!(
            Checkpoint::read_from(missing_sizes.as_bytes()),
            Err(FormatError::Json(_))
        ));
        let zero_input = r#"{"input_size": 0, "output_size": 2, "hidden_sizes": [], "state_dict": {}}"#;
        assert!(matches!(
            Checkpoint::read_from(zero_input.as_bytes()),
            Err(FormatError::Descriptor(NNError::InvalidArchitecture(_)))
        ));
    }

    #[test]
    fn test_overflowing_shape_is_a_format_error() {
        let record = r#"{
            "input_size": 2,
            "output_size": 2,
            "hidden_sizes": [],
            "state_dict": {
                "output_bias": { "shape": [4294967296, 4294967296], "data": [] }
            }
        }"#;
        let err = Checkpoint::read_from(record.as_bytes()).unwrap_err();
        assert!(
            matches!(&err, FormatError::ShapeOverflow { name, .. } if name == "output_bias"),
            "{}",
            err
        );
    }

    #[test]
    fn test_oversized_descriptor_fails_before_building() {
        // a 100000 x 100000 output layer would never fit in memory
        let record = r#"{"input_size": 100000, "output_size": 100000, "hidden_sizes": [], "state_dict": {}}"#;
        let checkpoint = Checkpoint::read_from(record.as_bytes()).unwrap();
        let err = checkpoint.into_model().err().unwrap();
        let CheckpointError::ShapeMismatch(report) = err else {
            panic!("expected a shape mismatch, got {}", err);
        };
        assert_eq!(report.names(), vec!["output_weight", "output_bias"]);
    }

    #[test]
    fn test_non_finite_parameters_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("diverged.json");
        let model = network(Architecture::new(2, 2, vec![3]).unwrap(), 13);
        let params = crate::nn::Module::parameters(&model);
        params[0].clone().set_data(f32::NAN);
        params[1].clone().set_data(f32::INFINITY);
        params[2].clone().set_data(f32::NEG_INFINITY);

        save(&model, &path).unwrap();
        let restored = load(&path).unwrap();
        let restored = crate::nn::Module::parameters(&restored);
        assert!(restored[0].data().is_nan());
        assert_eq!(restored[1].data(), f32::INFINITY);
        assert_eq!(restored[2].data(), f32::NEG_INFINITY);
        for (a, b) in restored.iter().zip(params.iter()).skip(3) {
            assert_eq!(a.data().to_bits(), b.data().to_bits());
        }
    }

    #[test]
    fn test_short_tensor_is_a_format_error() {
        let model = network(Architecture::new(2, 2, vec![3]).unwrap(), 8);
        let mut record = Checkpoint::from_model(&model);
        record
            .state_dict
            .get_mut("hidden_0_weight")
            .unwrap()
            .data
            .pop();
        let mut buffer = vec![];
        record.write_to(&mut buffer).unwrap();

        let err = Checkpoint::read_from(buffer.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            FormatError::TensorLength {
                expected: 6,
                actual: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_inconsistent_record_is_a_shape_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let small = network(Architecture::new(3, 2, vec![4]).unwrap(), 9);
        let record = Checkpoint {
            architecture: Architecture::new(3, 2, vec![5]).unwrap(),
            state_dict: small.state_dict(),
        };
        record.save(&path).unwrap();

        let err = load(&path).err().unwrap();
        let CheckpointError::ShapeMismatch(report) = err else {
            panic!("expected a shape mismatch, got {}", err);
        };
        assert_eq!(
            report.names(),
            vec!["hidden_0_weight", "hidden_0_bias", "output_weight"]
        );
    }

    #[test]
    fn test_extra_keys_are_reported() {
        let model = network(Architecture::new(2, 2, vec![2]).unwrap(), 10);
        let mut record = Checkpoint::from_model(&model);
        record
            .state_dict
            .insert("hidden_1_weight".into(), Tensor::new(vec![2, 2], vec![0.0; 4]));

        let err = record.into_model().err().unwrap();
        let CheckpointError::ShapeMismatch(report) = err else {
            panic!("expected a shape mismatch, got {}", err);
        };
        assert_eq!(
            report.mismatches,
            vec![Mismatch::Unexpected {
                name: "hidden_1_weight".into(),
                actual: vec![2, 2]
            }]
        );
    }

    #[test]
    fn test_load_into_matching_network() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        let arch = Architecture::new(3, 3, vec![4]).unwrap();
        let source = network(arch.clone(), 11);
        save(&source, &path).unwrap();

        let mut target = network(arch, 12);
        load_into(&mut target, &path).unwrap();
        assert_eq!(bits(&target), bits(&source));
    }
}
