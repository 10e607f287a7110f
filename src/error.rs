use ndarray::ShapeError;
use thiserror::Error;

/// Errors returned by the layer primitives.
///
/// Every error is fatal to the call that produced it, no partial output is returned.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LayerError {
    /// A mode string other than `"train"` or `"test"`.
    #[error("invalid mode {0:?}, expected \"train\" or \"test\"")]
    InvalidMode(String),
    /// A configuration value is out of range, or does not tile the input exactly.
    #[error("invalid {op} configuration: {reason}")]
    Config {
        /// The operation.
        op: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// Input, parameter, cache and gradient shapes disagree.
    #[error("{op} shape mismatch: {reason}")]
    Shape {
        /// The operation.
        op: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// A class label is outside of `0..classes`.
    #[error("label {label} of example {index} is out of range for {classes} classes")]
    Label {
        /// The example.
        index: usize,
        /// The label.
        label: usize,
        /// The number of classes.
        classes: usize,
    },
    /// A reshape failed.
    #[error(transparent)]
    Ndarray(#[from] ShapeError),
}

/// Result alias for [`LayerError`].
pub type Result<T, E = LayerError> = std::result::Result<T, E>;

/// Returns a [`LayerError::Shape`] unless `$cond` holds.
macro_rules! ensure_shape {
    ($cond:expr, $op:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::LayerError::Shape {
                op: $op,
                reason: format!($($arg)+),
            });
        }
    };
}

/// Returns a [`LayerError::Config`] unless `$cond` holds.
macro_rules! ensure_config {
    ($cond:expr, $op:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::LayerError::Config {
                op: $op,
                reason: format!($($arg)+),
            });
        }
    };
}

pub(crate) use {ensure_config, ensure_shape};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let error = LayerError::InvalidMode("eval".into());
        assert_eq!(
            error.to_string(),
            "invalid mode \"eval\", expected \"train\" or \"test\""
        );
        let error = LayerError::Shape {
            op: "affine_forward",
            reason: "expected 12 rows, found 10".into(),
        };
        assert_eq!(
            error.to_string(),
            "affine_forward shape mismatch: expected 12 rows, found 10"
        );
    }

    #[test]
    fn ensure_macros() {
        fn check(stride: usize) -> Result<()> {
            ensure_config!(stride > 0, "conv_forward_naive", "stride must be positive");
            ensure_shape!(stride < 4, "conv_forward_naive", "stride {stride} too large");
            Ok(())
        }
        assert!(check(1).is_ok());
        assert!(matches!(check(0), Err(LayerError::Config { .. })));
        assert!(matches!(check(4), Err(LayerError::Shape { .. })));
    }
}
