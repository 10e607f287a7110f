use super::Mode;
use crate::{
    error::{ensure_config, ensure_shape, LayerError, Result},
    scalar::Scalar,
};
use ndarray::{Array, ArrayBase, Data, Dimension};
use rand::{
    distributions::{Bernoulli, Distribution},
    rngs::StdRng,
    SeedableRng,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Dropout options.
///
/// Defaults:
/// - p: 0.5
/// - mode: [`Mode::Train`]
/// - seed: None
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoutParam {
    p: f64,
    mode: Mode,
    seed: Option<u64>,
}

impl Default for DropoutParam {
    fn default() -> Self {
        Self {
            p: 0.5,
            mode: Mode::Train,
            seed: None,
        }
    }
}

impl DropoutParam {
    /// Creates a new [`DropoutParam`] that drops each element with probability `p`.
    pub fn new(p: f64, mode: Mode) -> Self {
        Self {
            p,
            mode,
            seed: None,
        }
    }
    /// Seeds the mask, making [`dropout_forward`] deterministic.
    ///
    /// Intended for gradient checks, networks should not share a seed between calls.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..self
        }
    }
    /// Sets the mode.
    pub fn with_mode(self, mode: Mode) -> Self {
        Self { mode, ..self }
    }
    /// The drop probability.
    pub fn p(&self) -> f64 {
        self.p
    }
    /// The mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }
    /// The seed.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
    /// Checks that p is in [0, 1).
    ///
    /// **Errors**
    ///
    /// [`LayerError::Config`](crate::error::LayerError::Config).
    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            (0. ..1.).contains(&self.p),
            "dropout",
            "p must be in [0, 1), found {}",
            self.p
        );
        Ok(())
    }
}

/// Values saved by [`dropout_forward`].
#[derive(Clone, Debug)]
pub struct DropoutCache<T, D: Dimension> {
    param: DropoutParam,
    mask: Option<Array<T, D>>,
}

impl<T, D: Dimension> DropoutCache<T, D> {
    /// The options of the forward pass.
    pub fn param(&self) -> &DropoutParam {
        &self.param
    }
    /// The scaled keep mask, None in [`Mode::Test`].
    pub fn mask(&self) -> Option<&Array<T, D>> {
        self.mask.as_ref()
    }
}

/// Inverted dropout forward pass.
///
/// In [`Mode::Train`], each element is kept with probability `1 - p` and scaled by
/// `1 / (1 - p)`, so the expected output equals the input. In [`Mode::Test`], the output
/// is the input.
///
/// **Errors**
///
/// See [`DropoutParam::validate()`].
pub fn dropout_forward<T, S, D>(
    x: &ArrayBase<S, D>,
    param: &DropoutParam,
) -> Result<(Array<T, D>, DropoutCache<T, D>)>
where
    T: Scalar,
    S: Data<Elem = T>,
    D: Dimension,
{
    param.validate()?;
    trace!(x = ?x.shape(), p = param.p, mode = %param.mode, "dropout_forward");
    match param.mode {
        Mode::Train => {
            let keep = 1. - param.p;
            let bernoulli = Bernoulli::new(keep).map_err(|e| LayerError::Config {
                op: "dropout_forward",
                reason: e.to_string(),
            })?;
            let mut rng = match param.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let scale = T::from_config(keep).recip();
            let mask = Array::from_shape_simple_fn(x.raw_dim(), || {
                if bernoulli.sample(&mut rng) {
                    scale
                } else {
                    T::zero()
                }
            });
            let out = x * &mask;
            let cache = DropoutCache {
                param: param.clone(),
                mask: Some(mask),
            };
            Ok((out, cache))
        }
        Mode::Test => {
            let cache = DropoutCache {
                param: param.clone(),
                mask: None,
            };
            Ok((x.to_owned(), cache))
        }
    }
}

/// Inverted dropout backward pass.
///
/// In [`Mode::Train`] the gradient is masked like the forward pass, in [`Mode::Test`] it
/// passes through.
///
/// **Errors**
///
/// `dout` does not have the shape of the mask.
pub fn dropout_backward<T, S, D>(
    dout: &ArrayBase<S, D>,
    cache: DropoutCache<T, D>,
) -> Result<Array<T, D>>
where
    T: Scalar,
    S: Data<Elem = T>,
    D: Dimension,
{
    trace!(dout = ?dout.shape(), mode = %cache.param.mode, "dropout_backward");
    match cache.mask {
        Some(mask) => {
            ensure_shape!(
                dout.shape() == mask.shape(),
                "dropout_backward",
                "dout {:?} != mask {:?}",
                dout.shape(),
                mask.shape()
            );
            Ok(mask * dout)
        }
        None => Ok(dout.to_owned()),
    }
}
