//! Named parameter tensors and the report produced when they do not fit a model

use std::{
    collections::{BTreeMap, HashSet},
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A dense, row-major array of parameter values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    #[serde(with = "widened")]
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Number of elements implied by the shape, `None` if that overflows `usize`
    pub fn numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
    }

    /// Whether the stored data fills the declared shape exactly
    pub fn is_consistent(&self) -> bool {
        self.numel() == Some(self.data.len())
    }
}

/// Parameters keyed by layer identifier, e.g. `hidden_0_weight` or `output_bias`
pub type StateDict = BTreeMap<String, Tensor>;

// Values are written as f64: narrowing the parsed f64 back to f32 is exact even when the
// JSON reader is off by an ulp, so saved parameters come back bit for bit. JSON has no
// non-finite numbers, those are written as the strings "NaN", "inf" and "-inf".
mod widened {
    use std::fmt;

    use serde::{
        Deserialize, Deserializer, Serialize, Serializer,
        de::{self, Visitor},
    };

    struct Element(f32);

    impl Serialize for Element {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let v = self.0;
            if v.is_finite() {
                serializer.serialize_f64(f64::from(v))
            } else if v.is_nan() {
                serializer.serialize_str("NaN")
            } else if v > 0.0 {
                serializer.serialize_str("inf")
            } else {
                serializer.serialize_str("-inf")
            }
        }
    }

    struct ElementVisitor;

    impl Visitor<'_> for ElementVisitor {
        type Value = Element;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str(r#"a number, "NaN", "inf" or "-inf""#)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Element, E> {
            Ok(Element(v as f32))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Element, E> {
            Ok(Element(v as f32))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Element, E> {
            Ok(Element(v as f32))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Element, E> {
            match v {
                "NaN" => Ok(Element(f32::NAN)),
                "inf" => Ok(Element(f32::INFINITY)),
                "-inf" => Ok(Element(f32::NEG_INFINITY)),
                _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
            }
        }
    }

    impl<'de> Deserialize<'de> for Element {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(ElementVisitor)
        }
    }

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|&v| Element(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let elements = Vec::<Element>::deserialize(deserializer)?;
        Ok(elements.into_iter().map(|e| e.0).collect())
    }
}

/// One entry of a state dict that disagrees with the model it is loaded into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// Present on both sides with different shapes
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// Expected by the model, absent from the state dict
    Missing { name: String, expected: Vec<usize> },
    /// Present in the state dict, unknown to the model
    Unexpected { name: String, actual: Vec<usize> },
    /// Right shape, but the data does not fill it
    Length {
        name: String,
        expected: usize,
        actual: usize,
    },
}

impl Mismatch {
    pub fn name(&self) -> &str {
        match self {
            Mismatch::Shape { name, .. }
            | Mismatch::Missing { name, .. }
            | Mismatch::Unexpected { name, .. }
            | Mismatch::Length { name, .. } => name,
        }
    }
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Shape {
                name,
                expected,
                actual,
            } => write!(f, "{}: expected shape {:?}, got {:?}", name, expected, actual),
            Mismatch::Missing { name, expected } => {
                write!(f, "{}: missing, expected shape {:?}", name, expected)
            }
            Mismatch::Unexpected { name, actual } => {
                write!(f, "{}: unexpected entry with shape {:?}", name, actual)
            }
            Mismatch::Length {
                name,
                expected,
                actual,
            } => write!(f, "{}: expected {} values, got {}", name, expected, actual),
        }
    }
}

/// Every entry of a state dict that does not fit the target model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("state dict does not match the model ({} mismatched entries)\n{}", .mismatches.len(), render(.mismatches))]
pub struct ShapeMismatch {
    pub mismatches: Vec<Mismatch>,
}

fn render(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(|m| format!("  {}", m))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ShapeMismatch {
    pub fn names(&self) -> Vec<&str> {
        self.mismatches.iter().map(|m| m.name()).collect()
    }
}

/// Compares the shapes a model expects, in model order, against a state dict.
///
/// Mismatches are reported in model order, followed by unexpected entries in key order.
pub fn compare_shapes<'a, I>(expected: I, state_dict: &StateDict) -> Result<(), ShapeMismatch>
where
    I: IntoIterator<Item = (&'a str, Vec<usize>)>,
{
    let mut mismatches = vec![];
    let mut known = HashSet::new();
    for (name, expected) in expected {
        known.insert(name);
        match state_dict.get(name) {
            None => mismatches.push(Mismatch::Missing {
                name: name.to_string(),
                expected,
            }),
            Some(tensor) if tensor.shape != expected => mismatches.push(Mismatch::Shape {
                name: name.to_string(),
                expected,
                actual: tensor.shape.clone(),
            }),
            Some(tensor) if !tensor.is_consistent() => mismatches.push(Mismatch::Length {
                name: name.to_string(),
                expected: tensor.numel().unwrap_or(usize::MAX),
                actual: tensor.data.len(),
            }),
            Some(_) => {}
        }
    }
    for (name, tensor) in state_dict {
        if !known.contains(name.as_str()) {
            mismatches.push(Mismatch::Unexpected {
                name: name.clone(),
                actual: tensor.shape.clone(),
            });
        }
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(ShapeMismatch { mismatches })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_dict(entries: &[(&str, Vec<usize>)]) -> StateDict {
        entries
            .iter()
            .map(|(name, shape)| {
                let tensor = Tensor::new(shape.clone(), vec![0.0; shape.iter().product()]);
                (name.to_string(), tensor)
            })
            .collect()
    }

    #[test]
    fn test_matching_shapes() {
        let sd = state_dict(&[("w", vec![2, 3]), ("b", vec![2])]);
        assert!(compare_shapes([("w", vec![2, 3]), ("b", vec![2])], &sd).is_ok());
    }

    #[test]
    fn test_reports_every_mismatch() {
        let sd = state_dict(&[("w", vec![3, 3]), ("b", vec![2]), ("extra", vec![1])]);
        let err = compare_shapes(
            [("w", vec![2, 3]), ("b", vec![2]), ("v", vec![4])],
            &sd,
        )
        .unwrap_err();
        assert_eq!(
            err.mismatches,
            vec![
                Mismatch::Shape {
                    name: "w".into(),
                    expected: vec![2, 3],
                    actual: vec![3, 3]
                },
                Mismatch::Missing {
                    name: "v".into(),
                    expected: vec![4]
                },
                Mismatch::Unexpected {
                    name: "extra".into(),
                    actual: vec![1]
                },
            ]
        );
        assert_eq!(err.names(), vec!["w", "v", "extra"]);

        let message = err.to_string();
        assert!(message.contains("3 mismatched entries"));
        assert!(message.contains("w: expected shape [2, 3], got [3, 3]"));
        assert!(message.contains("extra: unexpected"));
    }

    #[test]
    fn test_reports_short_data() {
        let mut sd = state_dict(&[("b", vec![3])]);
        sd.get_mut("b").unwrap().data.pop();
        let err = compare_shapes([("b", vec![3])], &sd).unwrap_err();
        assert_eq!(
            err.mismatches,
            vec![Mismatch::Length {
                name: "b".into(),
                expected: 3,
                actual: 2
            }]
        );
    }

    #[test]
    fn test_tensor_consistency() {
        assert!(Tensor::new(vec![2, 2], vec![1.0; 4]).is_consistent());
        assert!(!Tensor::new(vec![2, 2], vec![1.0; 3]).is_consistent());
        assert_eq!(Tensor::new(vec![], vec![1.0]).numel(), Some(1));

        let huge = Tensor::new(vec![usize::MAX, 2], vec![]);
        assert_eq!(huge.numel(), None);
        assert!(!huge.is_consistent());
    }

    #[test]
    fn test_tensor_json_is_exact() {
        let data = vec![0.1f32, 1.0 / 3.0, -7.25e-8, f32::MAX, f32::MIN_POSITIVE];
        let tensor = Tensor::new(vec![5], data.clone());
        let json = serde_json::to_string(&tensor).unwrap();
        let restored: Tensor = serde_json::from_str(&json).unwrap();
        let bits = |d: &[f32]| d.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&restored.data), bits(&data));
        assert_eq!(restored.shape, vec![5]);
    }

    #[test]
    fn test_tensor_json_keeps_non_finite_values() {
        let tensor = Tensor::new(vec![4], vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 2.0]);
        let json = serde_json::to_string(&tensor).unwrap();
        assert_eq!(json, r#"{"shape":[4],"data":["NaN","inf","-inf",2.0]}"#);

        let restored: Tensor = serde_json::from_str(&json).unwrap();
        assert!(restored.data[0].is_nan());
        assert_eq!(restored.data[1..], [f32::INFINITY, f32::NEG_INFINITY, 2.0]);

        let bad = r#"{"shape":[1],"data":["nope"]}"#;
        assert!(serde_json::from_str::<Tensor>(bad).is_err());
        let null = r#"{"shape":[1],"data":[null]}"#;
        assert!(serde_json::from_str::<Tensor>(null).is_err());
    }
}
