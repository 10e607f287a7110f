use crate::{
    error::{ensure_config, ensure_shape, Result},
    scalar::Scalar,
};
use ndarray::{s, Array4, ArrayBase, Data, Ix4};

/// The number of window positions along one axis.
///
/// `1 + (input + 2 * pad - window) / stride`, which must divide exactly.
pub(crate) fn output_len(
    op: &'static str,
    axis: &str,
    input: usize,
    window: usize,
    pad: usize,
    stride: usize,
) -> Result<usize> {
    ensure_config!(stride > 0, op, "stride must be positive");
    ensure_config!(window > 0, op, "{axis} window must be positive");
    let padded = input + 2 * pad;
    ensure_shape!(
        window <= padded,
        op,
        "{axis} window {window} is larger than the padded input {padded}"
    );
    let span = padded - window;
    ensure_config!(
        span % stride == 0,
        op,
        "stride {stride} does not tile {axis} {input} (pad {pad}) with window {window}"
    );
    Ok(1 + span / stride)
}

/// A dense row major (N, C, H, W) buffer.
///
/// Sliding window loops index into the flat data directly.
#[derive(Clone, Debug)]
pub(crate) struct Buffer4<T> {
    data: Vec<T>,
    dim: [usize; 4],
}

impl<T: Scalar> Buffer4<T> {
    pub(crate) fn zeros(dim: [usize; 4]) -> Self {
        Self {
            data: vec![T::zero(); dim.iter().product()],
            dim,
        }
    }
    /// Copies `x`, zero padding H and W by `pad` on both sides.
    pub(crate) fn padded<S: Data<Elem = T>>(x: &ArrayBase<S, Ix4>, pad: usize) -> Self {
        let (n, c, h, w) = x.dim();
        let (hp, wp) = (h + 2 * pad, w + 2 * pad);
        let mut buffer = Self::zeros([n, c, hp, wp]);
        for (row, x_row) in x.rows().into_iter().enumerate() {
            // row enumerates (n, c, h) in order
            let offset = (row / h) * hp * wp + (row % h + pad) * wp + pad;
            for (y, x) in buffer.data[offset..offset + w].iter_mut().zip(x_row) {
                *y = *x;
            }
        }
        buffer
    }
    pub(crate) fn dim(&self) -> [usize; 4] {
        self.dim
    }
    #[inline]
    pub(crate) fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        let [_, cs, hs, ws] = self.dim;
        ((n * cs + c) * hs + h) * ws + w
    }
    #[inline]
    pub(crate) fn get(&self, n: usize, c: usize, h: usize, w: usize) -> T {
        self.data[self.offset(n, c, h, w)]
    }
    #[inline]
    pub(crate) fn get_mut(&mut self, n: usize, c: usize, h: usize, w: usize) -> &mut T {
        let offset = self.offset(n, c, h, w);
        &mut self.data[offset]
    }
    pub(crate) fn into_array(self) -> Result<Array4<T>> {
        Ok(Array4::from_shape_vec(self.dim, self.data)?)
    }
    /// Removes `pad` from both sides of H and W.
    pub(crate) fn into_cropped(self, pad: usize) -> Result<Array4<T>> {
        let [_, _, h, w] = self.dim;
        let array = self.into_array()?;
        if pad == 0 {
            return Ok(array);
        }
        Ok(array
            .slice_move(s![.., .., pad..h - pad, pad..w - pad])
            .as_standard_layout()
            .into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LayerError;
    use ndarray::Array;

    #[test]
    fn output_len_exact() -> anyhow::Result<()> {
        assert_eq!(output_len("conv", "height", 4, 2, 0, 1)?, 3);
        assert_eq!(output_len("conv", "height", 5, 3, 1, 2)?, 3);
        assert_eq!(output_len("pool", "width", 4, 2, 0, 2)?, 2);
        assert_eq!(output_len("pool", "width", 2, 2, 0, 7)?, 1);
        Ok(())
    }

    #[test]
    fn output_len_errors() {
        assert!(matches!(
            output_len("conv", "height", 5, 2, 0, 2),
            Err(LayerError::Config { .. })
        ));
        assert!(matches!(
            output_len("conv", "height", 5, 2, 0, 0),
            Err(LayerError::Config { .. })
        ));
        assert!(matches!(
            output_len("conv", "height", 2, 5, 1, 1),
            Err(LayerError::Shape { .. })
        ));
        assert!(output_len("pool", "width", 3, 0, 0, 1).is_err());
    }

    #[test]
    fn padded_crop_round_trip() -> anyhow::Result<()> {
        let x = Array::from_shape_fn([2, 3, 4, 5], |(n, c, h, w)| {
            (n * 1000 + c * 100 + h * 10 + w) as f64 + 1.
        });
        let buffer = Buffer4::padded(&x, 2);
        assert_eq!(buffer.dim(), [2, 3, 8, 9]);
        assert_eq!(buffer.get(0, 0, 0, 0), 0.);
        assert_eq!(buffer.get(1, 2, 2, 2), x[[1, 2, 0, 0]]);
        assert_eq!(buffer.get(1, 2, 5, 6), x[[1, 2, 3, 4]]);
        assert_eq!(buffer.get(1, 2, 6, 6), 0.);
        let sum: f64 = buffer.clone().into_array()?.sum();
        assert_eq!(sum, x.sum());
        assert_eq!(buffer.into_cropped(2)?, x);
        let buffer = Buffer4::padded(&x.view(), 0);
        assert_eq!(buffer.into_cropped(0)?, x);
        Ok(())
    }

    #[test]
    fn padded_non_standard_layout() -> anyhow::Result<()> {
        let x = Array::from_shape_fn([3, 2, 2, 4], |(n, c, h, w)| (n + c * 2 + h * 3 + w) as f32);
        let x_t = x.view().permuted_axes([1, 0, 2, 3]);
        let buffer = Buffer4::padded(&x_t, 1);
        let x_t = x_t.as_standard_layout().into_owned();
        assert_eq!(buffer.into_cropped(1)?, x_t);
        Ok(())
    }
}
