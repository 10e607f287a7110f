//! Layers built by chaining the primitives.
//!
//! Each forward function returns the caches of its stages in one struct, and the
//! backward function runs the stages in reverse.
use super::{
    affine::{affine_backward, affine_forward, AffineCache},
    batch_norm::{
        batchnorm_backward, batchnorm_forward, BatchNormCache, BatchNormParam, RunningStats,
    },
    conv::{conv_backward_naive, conv_forward_naive, ConvCache, ConvParam},
    pool::{max_pool_backward_naive, max_pool_forward_naive, PoolCache, PoolParam},
    relu::{relu_backward, relu_forward, ReluCache},
};
use crate::{
    error::{LayerError, Result},
    scalar::Scalar,
};
use ndarray::{Array1, Array2, Array4, ArrayBase, ArrayD, Data, Dimension, Ix1, Ix2, Ix4};

/// Caches of [`affine_relu_forward`].
#[derive(Clone, Debug)]
pub struct AffineReluCache<T> {
    affine: AffineCache<T>,
    relu: ReluCache<T, Ix2>,
}

impl<T> AffineReluCache<T> {
    /// The affine cache.
    pub fn affine(&self) -> &AffineCache<T> {
        &self.affine
    }
    /// The relu cache.
    pub fn relu(&self) -> &ReluCache<T, Ix2> {
        &self.relu
    }
}

/// Affine followed by relu.
///
/// **Errors**
///
/// See [`affine_forward()`].
pub fn affine_relu_forward<T, S1, S2, S3, D>(
    x: &ArrayBase<S1, D>,
    w: &ArrayBase<S2, Ix2>,
    b: &ArrayBase<S3, Ix1>,
) -> Result<(Array2<T>, AffineReluCache<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
    D: Dimension,
{
    let (a, affine) = affine_forward(x, w, b)?;
    let (out, relu) = relu_forward(&a);
    Ok((out, AffineReluCache { affine, relu }))
}

/// Backward pass of [`affine_relu_forward`], returns (dx, dw, db).
///
/// **Errors**
///
/// `dout` is not (N, M).
pub fn affine_relu_backward<T, S>(
    dout: &ArrayBase<S, Ix2>,
    cache: AffineReluCache<T>,
) -> Result<(ArrayD<T>, Array2<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    let da = relu_backward(dout, cache.relu)?;
    affine_backward(&da, cache.affine)
}

/// Caches of [`affine_batchnorm_relu_forward`].
///
/// The batch normalization cache is only present in train mode.
#[derive(Clone, Debug)]
pub struct AffineBatchNormReluCache<T> {
    affine: AffineCache<T>,
    batch_norm: Option<BatchNormCache<T>>,
    relu: ReluCache<T, Ix2>,
}

impl<T> AffineBatchNormReluCache<T> {
    /// The affine cache.
    pub fn affine(&self) -> &AffineCache<T> {
        &self.affine
    }
    /// The batch normalization cache, if computed in train mode.
    pub fn batch_norm(&self) -> Option<&BatchNormCache<T>> {
        self.batch_norm.as_ref()
    }
    /// The relu cache.
    pub fn relu(&self) -> &ReluCache<T, Ix2> {
        &self.relu
    }
}

/// Affine, then batch normalization, then relu.
///
/// **Errors**
///
/// See [`affine_forward()`] and [`batchnorm_forward()`].
#[allow(clippy::too_many_arguments)]
pub fn affine_batchnorm_relu_forward<T, S1, S2, S3, S4, S5, D>(
    x: &ArrayBase<S1, D>,
    w: &ArrayBase<S2, Ix2>,
    b: &ArrayBase<S3, Ix1>,
    gamma: &ArrayBase<S4, Ix1>,
    beta: &ArrayBase<S5, Ix1>,
    param: &BatchNormParam,
    running: &mut RunningStats<T>,
) -> Result<(Array2<T>, AffineBatchNormReluCache<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
    S4: Data<Elem = T>,
    S5: Data<Elem = T>,
    D: Dimension,
{
    let (a, affine) = affine_forward(x, w, b)?;
    let (a_norm, batch_norm) = batchnorm_forward(&a, gamma, beta, param, running)?;
    let (out, relu) = relu_forward(&a_norm);
    Ok((
        out,
        AffineBatchNormReluCache {
            affine,
            batch_norm,
            relu,
        },
    ))
}

/// Backward pass of [`affine_batchnorm_relu_forward`], returns
/// (dx, dw, db, dgamma, dbeta).
///
/// **Errors**
///
/// - The forward pass ran in test mode, so there is no batch normalization cache.
/// - `dout` is not (N, M).
#[allow(clippy::type_complexity)]
pub fn affine_batchnorm_relu_backward<T, S>(
    dout: &ArrayBase<S, Ix2>,
    cache: AffineBatchNormReluCache<T>,
) -> Result<(ArrayD<T>, Array2<T>, Array1<T>, Array1<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    let AffineBatchNormReluCache {
        affine,
        batch_norm,
        relu,
    } = cache;
    let batch_norm = batch_norm.ok_or_else(|| LayerError::Config {
        op: "affine_batchnorm_relu_backward",
        reason: "the forward pass did not run in train mode".into(),
    })?;
    let da_norm = relu_backward(dout, relu)?;
    let (da, dgamma, dbeta) = batchnorm_backward(&da_norm, batch_norm)?;
    let (dx, dw, db) = affine_backward(&da, affine)?;
    Ok((dx, dw, db, dgamma, dbeta))
}

/// Caches of [`conv_relu_forward`].
#[derive(Clone, Debug)]
pub struct ConvReluCache<T> {
    conv: ConvCache<T>,
    relu: ReluCache<T, Ix4>,
}

impl<T> ConvReluCache<T> {
    /// The convolution cache.
    pub fn conv(&self) -> &ConvCache<T> {
        &self.conv
    }
    /// The relu cache.
    pub fn relu(&self) -> &ReluCache<T, Ix4> {
        &self.relu
    }
}

/// Convolution followed by relu.
///
/// **Errors**
///
/// See [`conv_forward_naive()`].
pub fn conv_relu_forward<T, S1, S2, S3>(
    x: &ArrayBase<S1, Ix4>,
    w: &ArrayBase<S2, Ix4>,
    b: &ArrayBase<S3, Ix1>,
    param: &ConvParam,
) -> Result<(Array4<T>, ConvReluCache<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
{
    let (a, conv) = conv_forward_naive(x, w, b, param)?;
    let (out, relu) = relu_forward(&a);
    Ok((out, ConvReluCache { conv, relu }))
}

/// Backward pass of [`conv_relu_forward`], returns (dx, dw, db).
///
/// **Errors**
///
/// `dout` does not have the output shape.
pub fn conv_relu_backward<T, S>(
    dout: &ArrayBase<S, Ix4>,
    cache: ConvReluCache<T>,
) -> Result<(Array4<T>, Array4<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    let da = relu_backward(dout, cache.relu)?;
    conv_backward_naive(&da, cache.conv)
}

/// Caches of [`conv_relu_pool_forward`].
#[derive(Clone, Debug)]
pub struct ConvReluPoolCache<T> {
    conv: ConvCache<T>,
    relu: ReluCache<T, Ix4>,
    pool: PoolCache,
}

impl<T> ConvReluPoolCache<T> {
    /// The convolution cache.
    pub fn conv(&self) -> &ConvCache<T> {
        &self.conv
    }
    /// The relu cache.
    pub fn relu(&self) -> &ReluCache<T, Ix4> {
        &self.relu
    }
    /// The pool cache.
    pub fn pool(&self) -> &PoolCache {
        &self.pool
    }
}

/// Convolution, relu, then max pooling.
///
/// **Errors**
///
/// See [`conv_forward_naive()`] and [`max_pool_forward_naive()`].
pub fn conv_relu_pool_forward<T, S1, S2, S3>(
    x: &ArrayBase<S1, Ix4>,
    w: &ArrayBase<S2, Ix4>,
    b: &ArrayBase<S3, Ix1>,
    conv_param: &ConvParam,
    pool_param: &PoolParam,
) -> Result<(Array4<T>, ConvReluPoolCache<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
{
    let (a, conv) = conv_forward_naive(x, w, b, conv_param)?;
    let (s, relu) = relu_forward(&a);
    let (out, pool) = max_pool_forward_naive(&s, pool_param)?;
    Ok((out, ConvReluPoolCache { conv, relu, pool }))
}

/// Backward pass of [`conv_relu_pool_forward`], returns (dx, dw, db).
///
/// **Errors**
///
/// `dout` does not have the output shape.
pub fn conv_relu_pool_backward<T, S>(
    dout: &ArrayBase<S, Ix4>,
    cache: ConvReluPoolCache<T>,
) -> Result<(Array4<T>, Array4<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    let ds = max_pool_backward_naive(dout, cache.pool)?;
    let da = relu_backward(&ds, cache.relu)?;
    conv_backward_naive(&da, cache.conv)
}
