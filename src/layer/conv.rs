use super::{
    window::{output_len, Buffer4},
    Naive,
};
use crate::{
    error::{ensure_config, ensure_shape, Result},
    scalar::Scalar,
};
use ndarray::{Array1, Array4, ArrayBase, ArrayView1, ArrayView4, Data, Ix1, Ix4};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Convolution options.
///
/// Defaults:
/// - stride: 1
/// - pad: 0
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvParam {
    stride: usize,
    pad: usize,
}

impl Default for ConvParam {
    fn default() -> Self {
        Self { stride: 1, pad: 0 }
    }
}

impl ConvParam {
    /// Creates a new [`ConvParam`].
    pub fn new(stride: usize, pad: usize) -> Self {
        Self { stride, pad }
    }
    /// Sets the distance between adjacent receptive fields, along both H and W.
    pub fn with_stride(self, stride: usize) -> Self {
        Self { stride, ..self }
    }
    /// Sets the zero padding added to both sides of H and W.
    pub fn with_pad(self, pad: usize) -> Self {
        Self { pad, ..self }
    }
    /// The stride.
    pub fn stride(&self) -> usize {
        self.stride
    }
    /// The padding.
    pub fn pad(&self) -> usize {
        self.pad
    }
    /// Checks that the stride is positive.
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.stride > 0, "conv", "stride must be positive");
        Ok(())
    }
    /// The output (H', W') for `input` (H, W) and `filter` (HH, WW).
    ///
    /// H' = 1 + (H + 2 * pad - HH) / stride, W' likewise.
    ///
    /// **Errors**
    ///
    /// The stride is 0, or the output size is not an integer.
    pub fn output_shape(&self, input: [usize; 2], filter: [usize; 2]) -> Result<[usize; 2]> {
        self.output_shape_impl("conv", input, filter)
    }
    fn output_shape_impl(
        &self,
        op: &'static str,
        input: [usize; 2],
        filter: [usize; 2],
    ) -> Result<[usize; 2]> {
        let [h, w] = input;
        let [fh, fw] = filter;
        Ok([
            output_len(op, "height", h, fh, self.pad, self.stride)?,
            output_len(op, "width", w, fw, self.pad, self.stride)?,
        ])
    }
}

/// A 2d convolution.
///
/// [`Naive`] is the reference implementation; faster implementations must produce the
/// same outputs and gradients.
pub trait Conv2<T: Scalar> {
    /// Computes the output (N, F, H', W') of x (N, C, H, W), w (F, C, HH, WW), and b (F,).
    ///
    /// **Errors**
    ///
    /// The shapes are not compatible, see [`ConvParam::output_shape()`].
    fn forward(
        &self,
        x: ArrayView4<T>,
        w: ArrayView4<T>,
        b: ArrayView1<T>,
        param: &ConvParam,
    ) -> Result<Array4<T>>;
    /// Computes (dx, dw, db).
    ///
    /// **Errors**
    ///
    /// The shapes are not compatible, or dout is not (N, F, H', W').
    fn backward(
        &self,
        dout: ArrayView4<T>,
        x: ArrayView4<T>,
        w: ArrayView4<T>,
        param: &ConvParam,
    ) -> Result<(Array4<T>, Array4<T>, Array1<T>)>;
}

/// Checks x against w, returns (H', W').
fn geometry<T>(
    op: &'static str,
    x: &ArrayView4<T>,
    w: &ArrayView4<T>,
    param: &ConvParam,
) -> Result<[usize; 2]> {
    let (_n, c, h, wd) = x.dim();
    let (_f, wc, fh, fw) = w.dim();
    ensure_shape!(
        c == wc,
        op,
        "x {:?} has {c} channels, w {:?} has {wc}",
        x.shape(),
        w.shape()
    );
    param.output_shape_impl(op, [h, wd], [fh, fw])
}

impl<T: Scalar> Conv2<T> for Naive {
    fn forward(
        &self,
        x: ArrayView4<T>,
        w: ArrayView4<T>,
        b: ArrayView1<T>,
        param: &ConvParam,
    ) -> Result<Array4<T>> {
        const OP: &str = "conv_forward_naive";
        let [oh, ow] = geometry(OP, &x, &w, param)?;
        let (n, c, _h, _w) = x.dim();
        let (f, _c, fh, fw) = w.dim();
        ensure_shape!(
            b.len() == f,
            OP,
            "b has {} elements, w has {f} filters",
            b.len()
        );
        let stride = param.stride;
        let x = Buffer4::padded(&x, param.pad);
        let w = Buffer4::padded(&w, 0);
        let mut out = Buffer4::zeros([n, f, oh, ow]);
        for ni in 0..n {
            for fi in 0..f {
                for i in 0..oh {
                    for j in 0..ow {
                        let mut acc = b[fi];
                        for ci in 0..c {
                            for p in 0..fh {
                                for q in 0..fw {
                                    acc = acc
                                        + x.get(ni, ci, i * stride + p, j * stride + q)
                                            * w.get(fi, ci, p, q);
                                }
                            }
                        }
                        *out.get_mut(ni, fi, i, j) = acc;
                    }
                }
            }
        }
        out.into_array()
    }
    fn backward(
        &self,
        dout: ArrayView4<T>,
        x: ArrayView4<T>,
        w: ArrayView4<T>,
        param: &ConvParam,
    ) -> Result<(Array4<T>, Array4<T>, Array1<T>)> {
        const OP: &str = "conv_backward_naive";
        let [oh, ow] = geometry(OP, &x, &w, param)?;
        let (n, c, _h, _w) = x.dim();
        let (f, _c, fh, fw) = w.dim();
        ensure_shape!(
            dout.dim() == (n, f, oh, ow),
            OP,
            "dout {:?} != {:?}",
            dout.shape(),
            [n, f, oh, ow]
        );
        let stride = param.stride;
        let x = Buffer4::padded(&x, param.pad);
        let w = Buffer4::padded(&w, 0);
        let dout = Buffer4::padded(&dout, 0);
        let mut dx = Buffer4::zeros(x.dim());
        let mut dw = Buffer4::zeros(w.dim());
        let mut db = Array1::zeros(f);
        for ni in 0..n {
            for fi in 0..f {
                for i in 0..oh {
                    for j in 0..ow {
                        let dy = dout.get(ni, fi, i, j);
                        db[fi] = db[fi] + dy;
                        for ci in 0..c {
                            for p in 0..fh {
                                for q in 0..fw {
                                    let (h, wi) = (i * stride + p, j * stride + q);
                                    let dx = dx.get_mut(ni, ci, h, wi);
                                    *dx = *dx + w.get(fi, ci, p, q) * dy;
                                    let dw = dw.get_mut(fi, ci, p, q);
                                    *dw = *dw + x.get(ni, ci, h, wi) * dy;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok((dx.into_cropped(param.pad)?, dw.into_array()?, db))
    }
}

/// Inputs saved by [`conv_forward_naive`].
#[derive(Clone, Debug)]
pub struct ConvCache<T> {
    x: Array4<T>,
    w: Array4<T>,
    b: Array1<T>,
    param: ConvParam,
}

impl<T> ConvCache<T> {
    /// The input.
    pub fn x(&self) -> &Array4<T> {
        &self.x
    }
    /// The filters.
    pub fn w(&self) -> &Array4<T> {
        &self.w
    }
    /// The bias.
    pub fn b(&self) -> &Array1<T> {
        &self.b
    }
    /// The options.
    pub fn param(&self) -> &ConvParam {
        &self.param
    }
}

/// Convolution forward pass with [`Naive`].
///
/// - x: (N, C, H, W)
/// - w: (F, C, HH, WW)
/// - b: (F,)
///
/// Each input is zero padded by `pad`, then every filter is applied to every receptive
/// field, stepped by `stride`, across all channels. Returns the output
/// (N, F, H', W') and the cache.
///
/// **Errors**
///
/// - The channels of x and w differ, or b does not have F elements.
/// - See [`ConvParam::output_shape()`].
pub fn conv_forward_naive<T, S1, S2, S3>(
    x: &ArrayBase<S1, Ix4>,
    w: &ArrayBase<S2, Ix4>,
    b: &ArrayBase<S3, Ix1>,
    param: &ConvParam,
) -> Result<(Array4<T>, ConvCache<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
{
    trace!(x = ?x.shape(), w = ?w.shape(), ?param, "conv_forward_naive");
    let out = Naive.forward(x.view(), w.view(), b.view(), param)?;
    let cache = ConvCache {
        x: x.to_owned(),
        w: w.to_owned(),
        b: b.to_owned(),
        param: *param,
    };
    Ok((out, cache))
}

/// Convolution backward pass with [`Naive`].
///
/// Returns (dx, dw, db), with the shapes of (x, w, b).
///
/// **Errors**
///
/// `dout` is not (N, F, H', W').
pub fn conv_backward_naive<T, S>(
    dout: &ArrayBase<S, Ix4>,
    cache: ConvCache<T>,
) -> Result<(Array4<T>, Array4<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    trace!(dout = ?dout.shape(), "conv_backward_naive");
    let ConvCache { x, w, param, .. } = cache;
    Naive.backward(dout.view(), x.view(), w.view(), &param)
}
