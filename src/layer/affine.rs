use crate::{
    error::{ensure_shape, Result},
    scalar::Scalar,
};
use ndarray::{
    Array1, Array2, ArrayBase, ArrayD, ArrayView2, Axis, CowArray, Data, Dimension, Ix1, Ix2,
};
use tracing::trace;

/// Inputs saved by [`affine_forward`].
#[derive(Clone, Debug)]
pub struct AffineCache<T> {
    x: ArrayD<T>,
    w: Array2<T>,
    b: Array1<T>,
}

impl<T> AffineCache<T> {
    /// The input, in its original shape.
    pub fn x(&self) -> &ArrayD<T> {
        &self.x
    }
    /// The weight.
    pub fn w(&self) -> &Array2<T> {
        &self.w
    }
    /// The bias.
    pub fn b(&self) -> &Array1<T> {
        &self.b
    }
}

/// Reshapes (N, d1, .., dk) to (N, d1 * .. * dk).
fn flatten<'a, T, S, D>(x: &'a ArrayBase<S, D>, op: &'static str) -> Result<CowArray<'a, T, Ix2>>
where
    T: Scalar,
    S: Data<Elem = T>,
    D: Dimension,
{
    ensure_shape!(x.ndim() >= 1, op, "expected a batch axis, found a scalar");
    let n = x.shape()[0];
    let d = x.shape()[1..].iter().product::<usize>();
    Ok(x.as_standard_layout().into_shape([n, d])?)
}

/// Computes `x.dot(w) + b`, with each example of `x` flattened.
///
/// - x: (N, d1, .., dk)
/// - w: (D, M) where D = d1 * .. * dk
/// - b: (M,)
///
/// Returns the output of shape (N, M) and the cache.
///
/// **Errors**
///
/// The shapes of `x`, `w`, and `b` are not compatible.
pub fn affine_forward<T, S1, S2, S3, D>(
    x: &ArrayBase<S1, D>,
    w: &ArrayBase<S2, Ix2>,
    b: &ArrayBase<S3, Ix1>,
) -> Result<(Array2<T>, AffineCache<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    S3: Data<Elem = T>,
    D: Dimension,
{
    const OP: &str = "affine_forward";
    let x_flat = flatten(x, OP)?;
    let (_n, d) = x_flat.dim();
    let (inputs, outputs) = w.dim();
    ensure_shape!(
        d == inputs,
        OP,
        "x {:?} has {d} features, w {:?} expects {inputs}",
        x.shape(),
        w.shape()
    );
    ensure_shape!(
        b.len() == outputs,
        OP,
        "b has {} elements, w has {outputs} outputs",
        b.len()
    );
    trace!(x = ?x.shape(), w = ?w.shape(), "affine_forward");
    let out = x_flat.dot(w) + b;
    let cache = AffineCache {
        x: x.to_owned().into_dyn(),
        w: w.to_owned(),
        b: b.to_owned(),
    };
    Ok((out, cache))
}

/// Computes the gradients of an affine layer.
///
/// Returns (dx, dw, db), with the shapes of (x, w, b).
///
/// **Errors**
///
/// `dout` is not (N, M).
pub fn affine_backward<T, S>(
    dout: &ArrayBase<S, Ix2>,
    cache: AffineCache<T>,
) -> Result<(ArrayD<T>, Array2<T>, Array1<T>)>
where
    T: Scalar,
    S: Data<Elem = T>,
{
    const OP: &str = "affine_backward";
    let AffineCache { x, w, b: _ } = cache;
    let x_flat = flatten(&x, OP)?;
    let n = x_flat.nrows();
    let m = w.ncols();
    ensure_shape!(
        dout.dim() == (n, m),
        OP,
        "dout {:?} != ({n}, {m})",
        dout.shape()
    );
    trace!(dout = ?dout.shape(), "affine_backward");
    let x_flat: ArrayView2<T> = x_flat.view();
    let dw = x_flat.t().dot(dout);
    let db = dout.sum_axis(Axis(0));
    let dx = dout.dot(&w.t()).into_shape(x.raw_dim())?;
    Ok((dx, dw, db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, Array3};

    #[test]
    fn affine_forward_values() -> anyhow::Result<()> {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let w = array![[1.0, 0.0, -1.0], [0.5, 2.0, 1.0]];
        let b = array![0.0, 1.0, -1.0];
        let (y, cache) = affine_forward(&x, &w, &b)?;
        assert_abs_diff_eq!(y, array![[2.0, 5.0, 0.0], [5.0, 9.0, 0.0]], epsilon = 1e-12);
        assert_eq!(cache.x().shape(), [2, 2]);
        assert_eq!(cache.w(), &w);
        assert_eq!(cache.b(), &b);
        Ok(())
    }

    #[test]
    fn affine_flattens_examples() -> anyhow::Result<()> {
        let num_inputs = 2;
        let input_shape = [4, 5, 6];
        let output_dim = 3;
        let input_size = num_inputs * input_shape.iter().product::<usize>();
        let weight_size = output_dim * input_shape.iter().product::<usize>();
        let x = Array::linspace(-0.1, 0.5, input_size).into_shape([2, 4, 5, 6])?;
        let w = Array::linspace(-0.2, 0.3, weight_size).into_shape([120, 3])?;
        let b = Array::linspace(-0.3, 0.1, output_dim);
        let (y, _) = affine_forward(&x, &w, &b)?;
        let correct = array![
            [1.49834967, 1.70660132, 1.91485297],
            [3.25553199, 3.5141327, 3.77273342]
        ];
        assert_abs_diff_eq!(y, correct, epsilon = 1e-7);
        Ok(())
    }

    #[test]
    fn affine_backward_shapes() -> anyhow::Result<()> {
        let x = Array3::<f32>::ones([2, 3, 4]);
        let w = Array2::<f32>::ones([12, 5]);
        let b = Array1::<f32>::zeros(5);
        let (y, cache) = affine_forward(&x, &w, &b)?;
        assert_eq!(y, Array2::from_elem([2, 5], 12.0));
        let (dx, dw, db) = affine_backward(&Array2::ones([2, 5]), cache)?;
        assert_eq!(dx.shape(), [2, 3, 4]);
        assert!(dx.iter().all(|dx| *dx == 5.0));
        assert_eq!(dw, Array2::from_elem([12, 5], 2.0));
        assert_eq!(db, Array1::from_elem(5, 2.0));
        Ok(())
    }

    #[test]
    fn affine_shape_errors() -> anyhow::Result<()> {
        let x = Array2::<f64>::ones([2, 3]);
        let w = Array2::<f64>::ones([4, 2]);
        let b = Array1::<f64>::ones(2);
        assert!(affine_forward(&x, &w, &b).is_err());
        let w = Array2::<f64>::ones([3, 2]);
        assert!(affine_forward(&x, &w, &Array1::ones(3)).is_err());
        let (_, cache) = affine_forward(&x, &w, &b)?;
        assert!(affine_backward(&Array2::ones([2, 3]), cache).is_err());
        Ok(())
    }
}
