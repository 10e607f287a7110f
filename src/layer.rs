/*!
Forward and backward passes for network layers.

Each layer is a pair of free functions. The forward function returns the output and a
cache, and the backward function consumes that cache with the upstream gradient:

```
use convnet_layers::layer::relu::{relu_backward, relu_forward};
use ndarray::array;

# fn main() -> convnet_layers::error::Result<()> {
let (y, cache) = relu_forward(&array![-1., 0., 2.]);
assert_eq!(y, array![0., 0., 2.]);
let dx = relu_backward(&array![1., 1., 1.], cache)?;
assert_eq!(dx, array![0., 0., 1.]);
# Ok(())
# }
```
*/
use crate::error::LayerError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Affine / fully connected.
pub mod affine;
/// Batch normalization.
pub mod batch_norm;
/// Layers chained from the primitives.
pub mod composite;
/// Naive 2d convolution.
pub mod conv;
/// Inverted dropout.
pub mod dropout;
/// Naive 2d max pooling.
pub mod pool;
/// Rectified linear unit.
pub mod relu;
mod window;

/// Direct loop implementations of the windowed layers.
///
/// Slow, but simple enough to serve as the reference for [`conv::Conv2`] and
/// [`pool::MaxPool2`].
#[derive(Default, Clone, Copy, Debug)]
pub struct Naive;

/// Training or inference.
///
/// Parsed from `"train"` or `"test"`, any other string is [`LayerError::InvalidMode`].
/// Deserialization goes through the same parser.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Mode {
    /// Batch statistics, random masks.
    #[default]
    Train,
    /// Running statistics, identity dropout.
    Test,
}

impl Mode {
    /// The mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = LayerError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            _ => Err(LayerError::InvalidMode(s.to_string())),
        }
    }
}

impl TryFrom<&str> for Mode {
    type Error = LayerError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<String> for Mode {
    type Error = LayerError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_str() -> anyhow::Result<()> {
        assert_eq!("train".parse::<Mode>()?, Mode::Train);
        assert_eq!(Mode::try_from("test")?, Mode::Test);
        assert!(matches!(
            "eval".parse::<Mode>(),
            Err(LayerError::InvalidMode(mode)) if mode == "eval"
        ));
        Ok(())
    }

    #[test]
    fn mode_serde() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&Mode::Test)?, "\"test\"");
        assert_eq!(serde_json::from_str::<Mode>("\"train\"")?, Mode::Train);
        assert!(serde_json::from_str::<Mode>("\"Train\"").is_err());
        let error = serde_json::from_str::<Mode>("\"eval\"").unwrap_err();
        assert!(
            error
                .to_string()
                .starts_with(&LayerError::InvalidMode("eval".into()).to_string()),
            "{error}"
        );
        Ok(())
    }
}
