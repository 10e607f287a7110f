use crate::{
    error::{ensure_shape, Result},
    scalar::Scalar,
};
use ndarray::{Array, ArrayBase, Data, Dimension, Zip};
use tracing::trace;

/// Input saved by [`relu_forward`].
#[derive(Clone, Debug)]
pub struct ReluCache<T, D: Dimension> {
    x: Array<T, D>,
}

impl<T, D: Dimension> ReluCache<T, D> {
    /// The input of the forward pass.
    pub fn x(&self) -> &Array<T, D> {
        &self.x
    }
}

/// Computes `max(x, 0)` elementwise, for any shape.
pub fn relu_forward<T, S, D>(x: &ArrayBase<S, D>) -> (Array<T, D>, ReluCache<T, D>)
where
    T: Scalar,
    S: Data<Elem = T>,
    D: Dimension,
{
    trace!(x = ?x.shape(), "relu_forward");
    let out = x.mapv(|x| x.max(T::zero()));
    (out, ReluCache { x: x.to_owned() })
}

/// Passes `dout` where the input was positive, and 0 elsewhere.
///
/// Inputs equal to 0 are treated as inactive.
///
/// **Errors**
///
/// `dout` does not have the shape of the input.
pub fn relu_backward<T, S, D>(dout: &ArrayBase<S, D>, cache: ReluCache<T, D>) -> Result<Array<T, D>>
where
    T: Scalar,
    S: Data<Elem = T>,
    D: Dimension,
{
    let ReluCache { x } = cache;
    ensure_shape!(
        dout.shape() == x.shape(),
        "relu_backward",
        "dout {:?} != x {:?}",
        dout.shape(),
        x.shape()
    );
    trace!(dout = ?dout.shape(), "relu_backward");
    let mut dx = x;
    Zip::from(&mut dx).and(dout).for_each(|dx, &dy| {
        *dx = if *dx > T::zero() { dy } else { T::zero() };
    });
    Ok(dx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn relu_forward_backward() -> anyhow::Result<()> {
        let x = array![-1.0, 0.0, 2.0];
        let (y, cache) = relu_forward(&x);
        assert_eq!(y, array![0.0, 0.0, 2.0]);
        assert_eq!(cache.x(), &x);
        let dout = array![1.0, 1.0, 1.0];
        let dx = relu_backward(&dout, cache)?;
        assert_eq!(dx, array![0.0, 0.0, 1.0]);
        assert_eq!(dout, array![1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn relu_any_shape_f32() -> anyhow::Result<()> {
        let x = Array3::from_shape_fn([2, 3, 4], |(i, j, k)| {
            (i * 12 + j * 4 + k) as f32 - 12.0
        });
        let (y, cache) = relu_forward(&x.view());
        assert_eq!(y.shape(), [2, 3, 4]);
        assert!(y.iter().all(|y| *y >= 0.0));
        let dout = Array3::from_elem([2, 3, 4], 2.0f32);
        let dx = relu_backward(&dout, cache)?;
        assert_eq!(dx.iter().filter(|dx| **dx == 2.0).count(), 11);
        Ok(())
    }

    #[test]
    fn relu_backward_shape_mismatch() {
        let (_, cache) = relu_forward(&array![1.0, 2.0]);
        assert!(relu_backward(&array![1.0], cache).is_err());
    }
}
