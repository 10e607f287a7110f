use super::{
    window::{output_len, Buffer4},
    Naive,
};
use crate::{
    error::{ensure_config, ensure_shape, Result},
    scalar::Scalar,
};
use ndarray::{Array4, ArrayBase, ArrayView4, Data, Ix4};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Max pooling options.
///
/// Defaults:
/// - pool_height: 2
/// - pool_width: 2
/// - stride: 2
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolParam {
    pool_height: usize,
    pool_width: usize,
    stride: usize,
}

impl Default for PoolParam {
    fn default() -> Self {
        Self {
            pool_height: 2,
            pool_width: 2,
            stride: 2,
        }
    }
}

impl PoolParam {
    /// Creates a new [`PoolParam`] with a `pool` (height, width) window.
    pub fn new(pool: [usize; 2], stride: usize) -> Self {
        let [pool_height, pool_width] = pool;
        Self {
            pool_height,
            pool_width,
            stride,
        }
    }
    /// Sets the window (height, width).
    pub fn with_pool(self, pool: [usize; 2]) -> Self {
        Self::new(pool, self.stride)
    }
    /// Sets the stride.
    pub fn with_stride(self, stride: usize) -> Self {
        Self { stride, ..self }
    }
    /// The window height.
    pub fn pool_height(&self) -> usize {
        self.pool_height
    }
    /// The window width.
    pub fn pool_width(&self) -> usize {
        self.pool_width
    }
    /// The stride.
    pub fn stride(&self) -> usize {
        self.stride
    }
    /// Checks that the window and stride are positive.
    pub fn validate(&self) -> Result<()> {
        self.validate_impl("pool")
    }
    fn validate_impl(&self, op: &'static str) -> Result<()> {
        ensure_config!(
            self.pool_height > 0 && self.pool_width > 0,
            op,
            "pool size must be positive, found {}x{}",
            self.pool_height,
            self.pool_width
        );
        ensure_config!(self.stride > 0, op, "stride must be positive");
        Ok(())
    }
    /// The output (H', W') for `input` (H, W).
    ///
    /// **Errors**
    ///
    /// See [`.validate()`](Self::validate). The window is larger than the input, or
    /// the stride does not tile it exactly.
    pub fn output_shape(&self, input: [usize; 2]) -> Result<[usize; 2]> {
        self.output_shape_impl("pool", input)
    }
    fn output_shape_impl(&self, op: &'static str, input: [usize; 2]) -> Result<[usize; 2]> {
        self.validate_impl(op)?;
        let [h, w] = input;
        Ok([
            output_len(op, "height", h, self.pool_height, 0, self.stride)?,
            output_len(op, "width", w, self.pool_width, 0, self.stride)?,
        ])
    }
}

/// A 2d max pool.
///
/// [`Naive`] is the reference implementation.
pub trait MaxPool2<T: Scalar> {
    /// Computes the output (N, C, H', W') and the flat index of the max within each
    /// window, row major over (pool_height, pool_width).
    ///
    /// **Errors**
    ///
    /// See [`PoolParam::output_shape()`].
    fn forward(&self, x: ArrayView4<T>, param: &PoolParam)
        -> Result<(Array4<T>, Array4<usize>)>;
    /// Routes `dout` to the argmax of each window, returning dx with `input_shape`.
    ///
    /// **Errors**
    ///
    /// dout and argmax do not match the output shape for `input_shape`.
    fn backward(
        &self,
        dout: ArrayView4<T>,
        argmax: ArrayView4<usize>,
        input_shape: [usize; 4],
        param: &PoolParam,
    ) -> Result<Array4<T>>;
}

impl<T: Scalar> MaxPool2<T> for Naive {
    fn forward(
        &self,
        x: ArrayView4<T>,
        param: &PoolParam,
    ) -> Result<(Array4<T>, Array4<usize>)> {
        let (n, c, h, w) = x.dim();
        let [oh, ow] = param.output_shape_impl("max_pool_forward_naive", [h, w])?;
        let PoolParam {
            pool_height,
            pool_width,
            stride,
        } = *param;
        let x = Buffer4::padded(&x, 0);
        let mut out = Buffer4::zeros([n, c, oh, ow]);
        let mut argmax = Array4::zeros([n, c, oh, ow]);
        for ni in 0..n {
            for ci in 0..c {
                for i in 0..oh {
                    for j in 0..ow {
                        let mut max = x.get(ni, ci, i * stride, j * stride);
                        let mut index = 0;
                        for p in 0..pool_height {
                            for q in 0..pool_width {
                                let v = x.get(ni, ci, i * stride + p, j * stride + q);
                                // first occurrence wins ties
                                if v > max {
                                    max = v;
                                    index = p * pool_width + q;
                                }
                            }
                        }
                        *out.get_mut(ni, ci, i, j) = max;
                        argmax[[ni, ci, i, j]] = index;
                    }
                }
            }
        }
        Ok((out.into_array()?, argmax))
    }
    fn backward(
        &self,
        dout: ArrayView4<T>,
        argmax: ArrayView4<usize>,
        input_shape: [usize; 4],
        param: &PoolParam,
    ) -> Result<Array4<T>> {
        const OP: &str = "max_pool_backward_naive";
        let [n, c, h, w] = input_shape;
        let [oh, ow] = param.output_shape_impl(OP, [h, w])?;
        ensure_shape!(
            dout.dim() == (n, c, oh, ow),
            OP,
            "dout {:?} != {:?}",
            dout.shape(),
            [n, c, oh, ow]
        );
        ensure_shape!(
            argmax.dim() == dout.dim(),
            OP,
            "argmax {:?} != dout {:?}",
            argmax.shape(),
            dout.shape()
        );
        let PoolParam {
            pool_width, stride, ..
        } = *param;
        let window = param.pool_height * pool_width;
        let mut dx = Buffer4::zeros(input_shape);
        for ((ni, ci, i, j), &index) in argmax.indexed_iter() {
            ensure_shape!(
                index < window,
                OP,
                "argmax {index} is outside the {window} element window"
            );
            let (p, q) = (index / pool_width, index % pool_width);
            let dx = dx.get_mut(ni, ci, i * stride + p, j * stride + q);
            *dx = *dx + dout[[ni, ci, i, j]];
        }
        dx.into_array()
    }
}

/// State saved by [`max_pool_forward_naive`].
///
/// Only the input shape and the argmax are kept, not the input.
#[derive(Clone, Debug)]
pub struct PoolCache {
    shape: [usize; 4],
    argmax: Array4<usize>,
    param: PoolParam,
}

impl PoolCache {
    /// The input shape.
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }
    /// The flat index of the max within each window.
    pub fn argmax(&self) -> &Array4<usize> {
        &self.argmax
    }
    /// The options.
    pub fn param(&self) -> &PoolParam {
        &self.param
    }
}

/// Max pooling forward pass with [`Naive`].
///
/// x: (N, C, H, W) -> (N, C, H', W')
///
/// **Errors**
///
/// See [`PoolParam::output_shape()`].
pub fn max_pool_forward_naive<T, S>(
    x: &ArrayBase<S, Ix4>,
    param: &PoolParam,
) -> Result<(Array4<T>, PoolCache)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    trace!(x = ?x.shape(), ?param, "max_pool_forward_naive");
    let (out, argmax) = Naive.forward(x.view(), param)?;
    let (n, c, h, w) = x.dim();
    let cache = PoolCache {
        shape: [n, c, h, w],
        argmax,
        param: *param,
    };
    Ok((out, cache))
}

/// Max pooling backward pass with [`Naive`].
///
/// Each upstream gradient goes only to the input that was the max of its window, where
/// windows overlap the contributions add up.
///
/// **Errors**
///
/// `dout` is not (N, C, H', W').
pub fn max_pool_backward_naive<T, S>(
    dout: &ArrayBase<S, Ix4>,
    cache: PoolCache,
) -> Result<Array4<T>>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    trace!(dout = ?dout.shape(), "max_pool_backward_naive");
    Naive.backward(dout.view(), cache.argmax.view(), cache.shape, &cache.param)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LayerError;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array2};

    #[test]
    fn max_pool_2x2() -> anyhow::Result<()> {
        let x = Array::from_shape_vec([1, 1, 2, 2], vec![1., 2., 3., 4.])?;
        let (y, cache) = max_pool_forward_naive(&x, &PoolParam::default())?;
        assert_eq!(y, Array::from_elem([1, 1, 1, 1], 4.));
        assert_eq!(cache.argmax()[[0, 0, 0, 0]], 3);
        let dx = max_pool_backward_naive(&Array4::<f64>::ones([1, 1, 1, 1]), cache)?;
        assert_eq!(dx, Array::from_shape_vec([1, 1, 2, 2], vec![0., 0., 0., 1.])?);
        Ok(())
    }

    #[test]
    fn max_pool_reference_values() -> anyhow::Result<()> {
        let x = Array::linspace(-0.3f64, 0.4, 2 * 3 * 4 * 4).into_shape([2, 3, 4, 4])?;
        let (y, _) = max_pool_forward_naive(&x, &PoolParam::default())?;
        assert_eq!(y.dim(), (2, 3, 2, 2));
        // linspace is increasing, so each max is the bottom right of its window
        for ((n, c, i, j), &v) in y.indexed_iter() {
            assert_abs_diff_eq!(v, x[[n, c, 2 * i + 1, 2 * j + 1]]);
        }
        let correct = Array2::from_shape_vec(
            [2, 2],
            vec![-0.26315789, -0.24842105, -0.20421053, -0.18947368],
        )?;
        assert_abs_diff_eq!(y.slice(ndarray::s![0, 0, .., ..]), correct, epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn max_pool_ties_first() -> anyhow::Result<()> {
        let x = Array4::from_elem([1, 2, 2, 2], 1.0f32);
        let (_, cache) = max_pool_forward_naive(&x, &PoolParam::default())?;
        assert!(cache.argmax().iter().all(|&i| i == 0));
        Ok(())
    }

    #[test]
    fn max_pool_overlapping_accumulates() -> anyhow::Result<()> {
        let x = Array::from_shape_vec([1, 1, 3, 3], vec![0., 0., 0., 0., 9., 0., 0., 0., 0.])?;
        let param = PoolParam::new([2, 2], 1);
        let (y, cache) = max_pool_forward_naive(&x, &param)?;
        assert_eq!(y, Array::from_elem([1, 1, 2, 2], 9.));
        let dout = Array::from_shape_vec([1, 1, 2, 2], vec![1., 2., 3., 4.])?;
        let dx = max_pool_backward_naive(&dout, cache)?;
        assert_eq!(dx[[0, 0, 1, 1]], 10.);
        assert_eq!(dx.sum(), 10.);
        // dout is not modified
        assert_eq!(dout.sum(), 10.);
        Ok(())
    }

    #[test]
    fn max_pool_errors() -> anyhow::Result<()> {
        let x = Array4::<f64>::zeros([1, 1, 5, 5]);
        assert!(matches!(
            max_pool_forward_naive(&x, &PoolParam::default()),
            Err(LayerError::Config { .. })
        ));
        assert!(matches!(
            max_pool_forward_naive(&x, &PoolParam::new([0, 2], 1)),
            Err(LayerError::Config { .. })
        ));
        assert!(matches!(
            max_pool_forward_naive(&x, &PoolParam::new([6, 6], 1)),
            Err(LayerError::Shape { .. })
        ));
        let (_, cache) = max_pool_forward_naive(&x, &PoolParam::new([3, 3], 2))?;
        assert!(max_pool_backward_naive(&Array4::<f64>::zeros([1, 1, 3, 3]), cache).is_err());
        assert!(PoolParam::default().with_stride(0).validate().is_err());
        Ok(())
    }

    #[test]
    fn pool_param_serde() -> anyhow::Result<()> {
        let param: PoolParam = serde_json::from_str(r#"{"stride": 1}"#)?;
        assert_eq!(param, PoolParam::new([2, 2], 1));
        let param: PoolParam = serde_json::from_str(r#"{"pool_height": 3, "pool_width": 3}"#)?;
        assert_eq!(param.output_shape([7, 7])?, [3, 3]);
        Ok(())
    }
}
