use super::Mode;
use crate::{
    error::{ensure_config, ensure_shape, LayerError, Result},
    scalar::Scalar,
};
use ndarray::{Array1, Array2, Array4, ArrayBase, Axis, Data, Ix1, Ix2, Ix4};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Batch normalization options.
///
/// Defaults:
/// - mode: [`Mode::Train`]
/// - eps: 1e-5
/// - momentum: 0.9
///
/// Missing fields are filled with the defaults when deserializing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormParam {
    mode: Mode,
    eps: f64,
    momentum: f64,
}

impl Default for BatchNormParam {
    fn default() -> Self {
        Self {
            mode: Mode::Train,
            eps: 1e-5,
            momentum: 0.9,
        }
    }
}

impl BatchNormParam {
    /// Creates a new [`BatchNormParam`] for `mode`, with default eps and momentum.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
    /// Sets the mode.
    pub fn with_mode(self, mode: Mode) -> Self {
        Self { mode, ..self }
    }
    /// Sets the constant added to the variance for numerical stability.
    pub fn with_eps(self, eps: f64) -> Self {
        Self { eps, ..self }
    }
    /// Sets the decay of the running statistics.
    ///
    /// 0 replaces the running statistics with those of the batch, 1 never updates them.
    pub fn with_momentum(self, momentum: f64) -> Self {
        Self { momentum, ..self }
    }
    /// The mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }
    /// The eps.
    pub fn eps(&self) -> f64 {
        self.eps
    }
    /// The momentum.
    pub fn momentum(&self) -> f64 {
        self.momentum
    }
    /// Checks that eps is positive and momentum is in [0, 1].
    ///
    /// **Errors**
    ///
    /// [`LayerError::Config`](crate::error::LayerError::Config).
    pub fn validate(&self) -> Result<()> {
        const OP: &str = "batchnorm";
        ensure_config!(
            self.eps > 0. && self.eps.is_finite(),
            OP,
            "eps must be positive, found {}",
            self.eps
        );
        ensure_config!(
            (0. ..=1.).contains(&self.momentum),
            OP,
            "momentum must be in [0, 1], found {}",
            self.momentum
        );
        Ok(())
    }
}

/// Running mean and variance of each feature.
///
/// Owned by the caller and updated by [`batchnorm_forward`] in [`Mode::Train`]. An empty
/// [`RunningStats`] is initialized with zeros on the first call.
///
/// Deserialization checks that mean and var have the same length.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "RunningStatsRecord<T>",
    bound(deserialize = "T: Scalar + Deserialize<'de>")
)]
pub struct RunningStats<T> {
    mean: Array1<T>,
    var: Array1<T>,
}

#[derive(Deserialize)]
struct RunningStatsRecord<T> {
    mean: Array1<T>,
    var: Array1<T>,
}

impl<T: Scalar> TryFrom<RunningStatsRecord<T>> for RunningStats<T> {
    type Error = LayerError;
    fn try_from(record: RunningStatsRecord<T>) -> Result<Self> {
        Self::from_mean_var(record.mean, record.var)
    }
}

impl<T: Scalar> Default for RunningStats<T> {
    fn default() -> Self {
        Self::zeros(0)
    }
}

impl<T: Scalar> RunningStats<T> {
    /// Empty statistics, sized on first use.
    pub fn new() -> Self {
        Self::default()
    }
    /// Zero mean and variance for `features`.
    pub fn zeros(features: usize) -> Self {
        Self {
            mean: Array1::zeros(features),
            var: Array1::zeros(features),
        }
    }
    /// Creates from a known `mean` and `var`.
    ///
    /// **Errors**
    ///
    /// The lengths differ.
    pub fn from_mean_var(mean: Array1<T>, var: Array1<T>) -> Result<Self> {
        ensure_shape!(
            mean.len() == var.len(),
            "RunningStats",
            "mean has {} features, var has {}",
            mean.len(),
            var.len()
        );
        Ok(Self { mean, var })
    }
    /// The running mean.
    pub fn mean(&self) -> &Array1<T> {
        &self.mean
    }
    /// The running variance.
    pub fn var(&self) -> &Array1<T> {
        &self.var
    }
    /// The number of features.
    pub fn len(&self) -> usize {
        self.mean.len()
    }
    /// Whether the statistics have not been sized yet.
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
    fn prepare(&mut self, features: usize, op: &'static str) -> Result<()> {
        if self.is_empty() && self.var.is_empty() && features > 0 {
            debug!(features, "{op}: initializing running statistics");
            *self = Self::zeros(features);
        }
        ensure_shape!(
            self.mean.len() == features && self.var.len() == features,
            op,
            "running statistics have {} / {} features, x has {features}",
            self.mean.len(),
            self.var.len()
        );
        Ok(())
    }
    fn update(&mut self, mean: &Array1<T>, var: &Array1<T>, momentum: T) {
        let decay = T::one() - momentum;
        self.mean = &self.mean * momentum + mean * decay;
        self.var = &self.var * momentum + var * decay;
    }
}

/// Values saved by [`batchnorm_forward`] in [`Mode::Train`].
#[derive(Clone, Debug)]
pub struct BatchNormCache<T> {
    x: Array2<T>,
    mean: Array1<T>,
    var: Array1<T>,
    x_norm: Array2<T>,
    beta: Array1<T>,
    gamma: Array1<T>,
    eps: T,
}

impl<T> BatchNormCache<T> {
    /// The input.
    pub fn x(&self) -> &Array2<T> {
        &self.x
    }
    /// The batch mean.
    pub fn mean(&self) -> &Array1<T> {
        &self.mean
    }
    /// The biased batch variance.
    pub fn var(&self) -> &Array1<T> {
        &self.var
    }
    /// The normalized input, before scale and shift.
    pub fn x_norm(&self) -> &Array2<T> {
        &self.x_norm
    }
    /// The shift.
    pub fn beta(&self) -> &Array1<T> {
        &self.beta
    }
    /// The scale.
    pub fn gamma(&self) -> &Array1<T> {
        &self.gamma
    }
    /// The eps.
    pub fn eps(&self) -> T
    where
        T: Copy,
    {
        self.eps
    }
}

/// Derivation used for the batch normalization backward pass.
///
/// Both produce the same gradients up to rounding. Computing both for one cache is a
/// cross check of the implementation.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BatchNormBackward {
    /// Propagates through the variance and mean of the batch in stages.
    #[default]
    Staged,
    /// One closed form expression for dx.
    Simplified,
}

/// Batch normalization forward pass.
///
/// - x: (N, D)
/// - gamma: (D,)
/// - beta: (D,)
///
/// In [`Mode::Train`], normalizes with the batch mean and biased variance of each
/// feature and updates `running` with
/// `running = momentum * running + (1 - momentum) * batch`. In [`Mode::Test`],
/// normalizes with `running` and returns no cache.
///
/// The output is `gamma * x_norm + beta`, of shape (N, D).
///
/// **Errors**
///
/// - [`BatchNormParam::validate()`].
/// - gamma, beta, or `running` do not have D features.
/// - An empty batch in [`Mode::Train`].
pub fn batchnorm_forward<T, S1, S2, S3>(
    x: &ArrayBase<S1, Ix2>,
    gamma: &ArrayBase<S2, Ix1>,
    beta: &ArrayBase<S3, Ix1>,
    param: &BatchNormParam,
    running: &mut RunningStats<T>,
) -> Result<(Array2<T>, Option<BatchNormCache<T>>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
{
    batchnorm_forward_impl("batchnorm_forward", x, gamma, beta, param, running)
}

fn batchnorm_forward_impl<T, S1, S2, S3>(
    op: &'static str,
    x: &ArrayBase<S1, Ix2>,
    gamma: &ArrayBase<S2, Ix1>,
    beta: &ArrayBase<S3, Ix1>,
    param: &BatchNormParam,
    running: &mut RunningStats<T>,
) -> Result<(Array2<T>, Option<BatchNormCache<T>>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
{
    param.validate()?;
    let (n, d) = x.dim();
    ensure_shape!(
        gamma.len() == d,
        op,
        "gamma has {} features, x has {d}",
        gamma.len()
    );
    ensure_shape!(
        beta.len() == d,
        op,
        "beta has {} features, x has {d}",
        beta.len()
    );
    if param.mode == Mode::Train {
        ensure_shape!(n > 0, op, "cannot compute batch statistics of 0 examples");
    }
    running.prepare(d, op)?;
    trace!(x = ?x.shape(), mode = %param.mode, "{op}");
    let eps = T::from_config(param.eps);
    match param.mode {
        Mode::Train => {
            let count = T::from_len(n);
            let mean = x.sum_axis(Axis(0)) / count;
            let centered = x - &mean;
            let var = centered.mapv(|x| x * x).sum_axis(Axis(0)) / count;
            let std = var.mapv(|var| (var + eps).sqrt());
            let x_norm = centered / &std;
            let out = &x_norm * gamma + beta;
            running.update(&mean, &var, T::from_config(param.momentum));
            debug!(momentum = param.momentum, "{op}: updated running statistics");
            let cache = BatchNormCache {
                x: x.to_owned(),
                mean,
                var,
                x_norm,
                beta: beta.to_owned(),
                gamma: gamma.to_owned(),
                eps,
            };
            Ok((out, Some(cache)))
        }
        Mode::Test => {
            let std = running.var.mapv(|var| (var + eps).sqrt());
            let x_norm = (x - &running.mean) / &std;
            let out = x_norm * gamma + beta;
            Ok((out, None))
        }
    }
}

/// Batch normalization backward pass, see [`BatchNormBackward::Staged`].
///
/// Returns (dx, dgamma, dbeta).
///
/// **Errors**
///
/// `dout` does not have the shape of x.
pub fn batchnorm_backward<T, S>(
    dout: &ArrayBase<S, Ix2>,
    cache: BatchNormCache<T>,
) -> Result<(Array2<T>, Array1<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    batchnorm_backward_with(dout, cache, BatchNormBackward::Staged)
}

/// Batch normalization backward pass, see [`BatchNormBackward::Simplified`].
///
/// Returns (dx, dgamma, dbeta).
///
/// **Errors**
///
/// `dout` does not have the shape of x.
pub fn batchnorm_backward_alt<T, S>(
    dout: &ArrayBase<S, Ix2>,
    cache: BatchNormCache<T>,
) -> Result<(Array2<T>, Array1<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    batchnorm_backward_with(dout, cache, BatchNormBackward::Simplified)
}

/// Batch normalization backward pass with `strategy`.
///
/// Returns (dx, dgamma, dbeta).
///
/// **Errors**
///
/// `dout` does not have the shape of x.
pub fn batchnorm_backward_with<T, S>(
    dout: &ArrayBase<S, Ix2>,
    cache: BatchNormCache<T>,
    strategy: BatchNormBackward,
) -> Result<(Array2<T>, Array1<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    backward_impl("batchnorm_backward", dout, &cache, strategy)
}

fn backward_impl<T, S>(
    op: &'static str,
    dout: &ArrayBase<S, Ix2>,
    cache: &BatchNormCache<T>,
    strategy: BatchNormBackward,
) -> Result<(Array2<T>, Array1<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    ensure_shape!(
        dout.shape() == cache.x.shape(),
        op,
        "dout {:?} != x {:?}",
        dout.shape(),
        cache.x.shape()
    );
    trace!(dout = ?dout.shape(), ?strategy, "{op}");
    let dbeta = dout.sum_axis(Axis(0));
    let dgamma = (&cache.x_norm * dout).sum_axis(Axis(0));
    let dx = match strategy {
        BatchNormBackward::Staged => staged_dx(dout, cache),
        BatchNormBackward::Simplified => simplified_dx(dout, cache, &dbeta),
    };
    Ok((dx, dgamma, dbeta))
}

fn staged_dx<T, S>(dout: &ArrayBase<S, Ix2>, cache: &BatchNormCache<T>) -> Array2<T>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    let BatchNormCache {
        x,
        mean,
        var,
        gamma,
        eps,
        ..
    } = cache;
    let n = T::from_len(x.nrows());
    let two = T::one() + T::one();
    let var_eps = var.mapv(|var| var + *eps);
    let std = var_eps.mapv(T::sqrt);
    let inv_std = std.mapv(T::recip);
    let centered = x - mean;
    let dx_norm = dout * gamma;
    let dvar = (&dx_norm * &centered).sum_axis(Axis(0)) / (&var_eps * &std) / -two;
    let dmean = -(&dx_norm * &inv_std).sum_axis(Axis(0))
        + &dvar * &centered.sum_axis(Axis(0)) * -two / n;
    &dx_norm * &inv_std + &centered * &dvar * two / n + dmean / n
}

fn simplified_dx<T, S>(
    dout: &ArrayBase<S, Ix2>,
    cache: &BatchNormCache<T>,
    dbeta: &Array1<T>,
) -> Array2<T>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    let BatchNormCache {
        x_norm,
        var,
        gamma,
        eps,
        ..
    } = cache;
    let n = T::from_len(x_norm.nrows());
    let scale = gamma * &var.mapv(|var| (var + *eps).sqrt().recip()) / n;
    let dout_x_norm = (dout * x_norm).sum_axis(Axis(0));
    (dout * n - dbeta - x_norm * &dout_x_norm) * &scale
}

/// Values saved by [`spatial_batchnorm_forward`] in [`Mode::Train`].
#[derive(Clone, Debug)]
pub struct SpatialBatchNormCache<T> {
    inner: BatchNormCache<T>,
    shape: [usize; 4],
}

impl<T> SpatialBatchNormCache<T> {
    /// The cache of the channel last batch normalization.
    pub fn inner(&self) -> &BatchNormCache<T> {
        &self.inner
    }
    /// The shape of x, (N, C, H, W).
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }
}

/// (N, C, H, W) -> (N * H * W, C)
fn to_channel_last<T, S>(x: &ArrayBase<S, Ix4>) -> Result<Array2<T>>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    let (n, c, h, w) = x.dim();
    let x = x.view().permuted_axes([0, 2, 3, 1]);
    Ok(x.as_standard_layout().into_owned().into_shape([n * h * w, c])?)
}

/// (N * H * W, C) -> (N, C, H, W)
fn from_channel_last<T: Scalar>(x: Array2<T>, shape: [usize; 4]) -> Result<Array4<T>> {
    let [n, c, h, w] = shape;
    let x = x.into_shape([n, h, w, c])?.permuted_axes([0, 3, 1, 2]);
    Ok(x.as_standard_layout().into_owned())
}

/// Spatial batch normalization forward pass.
///
/// - x: (N, C, H, W)
/// - gamma: (C,)
/// - beta: (C,)
///
/// Normalizes each channel over N, H, and W, by treating every (n, h, w) as an example
/// of [`batchnorm_forward`].
///
/// **Errors**
///
/// See [`batchnorm_forward`].
pub fn spatial_batchnorm_forward<T, S1, S2, S3>(
    x: &ArrayBase<S1, Ix4>,
    gamma: &ArrayBase<S2, Ix1>,
    beta: &ArrayBase<S3, Ix1>,
    param: &BatchNormParam,
    running: &mut RunningStats<T>,
) -> Result<(Array4<T>, Option<SpatialBatchNormCache<T>>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
{
    let (n, c, h, w) = x.dim();
    let shape = [n, c, h, w];
    let x = to_channel_last(x)?;
    let (out, cache) = batchnorm_forward_impl(
        "spatial_batchnorm_forward",
        &x,
        gamma,
        beta,
        param,
        running,
    )?;
    let out = from_channel_last(out, shape)?;
    Ok((
        out,
        cache.map(|inner| SpatialBatchNormCache { inner, shape }),
    ))
}

/// Spatial batch normalization backward pass, see [`BatchNormBackward::Staged`].
///
/// Returns (dx, dgamma, dbeta).
///
/// **Errors**
///
/// `dout` does not have the shape of x.
pub fn spatial_batchnorm_backward<T, S>(
    dout: &ArrayBase<S, Ix4>,
    cache: SpatialBatchNormCache<T>,
) -> Result<(Array4<T>, Array1<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    spatial_batchnorm_backward_with(dout, cache, BatchNormBackward::Staged)
}

/// Spatial batch normalization backward pass with `strategy`.
///
/// Returns (dx, dgamma, dbeta).
///
/// **Errors**
///
/// `dout` does not have the shape of x.
pub fn spatial_batchnorm_backward_with<T, S>(
    dout: &ArrayBase<S, Ix4>,
    cache: SpatialBatchNormCache<T>,
    strategy: BatchNormBackward,
) -> Result<(Array4<T>, Array1<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    const OP: &str = "spatial_batchnorm_backward";
    let SpatialBatchNormCache { inner, shape } = cache;
    ensure_shape!(
        dout.shape() == shape,
        OP,
        "dout {:?} != x {shape:?}",
        dout.shape()
    );
    let dout = to_channel_last(dout)?;
    let (dx, dgamma, dbeta) = backward_impl(OP, &dout, &inner, strategy)?;
    Ok((from_channel_last(dx, shape)?, dgamma, dbeta))
}
