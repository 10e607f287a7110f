/*!
Central finite difference gradients.

Used to validate the analytic backward passes:

```
use convnet_layers::{gradient_check::{eval_numerical_gradient_array, rel_error}, layer::relu};
use ndarray::array;

# fn main() -> convnet_layers::error::Result<()> {
let x = array![[-0.5, 0.25], [1.5, -2.0]];
let dout = array![[1.0, 2.0], [3.0, 4.0]];
let dx_num = eval_numerical_gradient_array(|x| Ok(relu::relu_forward(x).0), &x, &dout, 1e-5)?;
let (_, cache) = relu::relu_forward(&x);
let dx = relu::relu_backward(&dout, cache)?;
assert!(rel_error(&dx, &dx_num)? < 1e-8);
# Ok(())
# }
```
*/
use crate::{
    error::{ensure_shape, Result},
    scalar::Scalar,
};
use ndarray::{indices_of, Array, ArrayBase, Data, Dimension, IntoDimension, Zip};

/// Floor of the denominator in [`rel_error`].
pub const REL_ERROR_EPS: f64 = 1e-8;

/// Evaluates the gradient of a scalar function `f` at `x`.
///
/// Each element of `x` is perturbed by `±h` in turn.
///
/// **Errors**
///
/// Propagates errors from `f`.
pub fn eval_numerical_gradient<T, S, D, F>(
    mut f: F,
    x: &ArrayBase<S, D>,
    h: T,
) -> Result<Array<T, D>>
where
    T: Scalar,
    S: Data<Elem = T>,
    D: Dimension,
    F: FnMut(&Array<T, D>) -> Result<T>,
{
    let mut x = x.to_owned();
    let mut grad = Array::zeros(x.raw_dim());
    for index in indices_of(&x) {
        let index = index.into_dimension();
        let old = x[index.clone()];
        x[index.clone()] = old + h;
        let fxph = f(&x)?;
        x[index.clone()] = old - h;
        let fxmh = f(&x)?;
        x[index.clone()] = old;
        grad[index] = (fxph - fxmh) / (h + h);
    }
    Ok(grad)
}

/// Evaluates the gradient of an array valued function `f` at `x`, contracted with the
/// upstream gradient `dout`.
///
/// This is what the backward pass of a layer computes for the input `x`.
///
/// **Errors**
///
/// - Propagates errors from `f`.
/// - The output of `f` does not have the shape of `dout`.
pub fn eval_numerical_gradient_array<T, S1, S2, D, E, F>(
    mut f: F,
    x: &ArrayBase<S1, D>,
    dout: &ArrayBase<S2, E>,
    h: T,
) -> Result<Array<T, D>>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    D: Dimension,
    E: Dimension,
    F: FnMut(&Array<T, D>) -> Result<Array<T, E>>,
{
    const OP: &str = "eval_numerical_gradient_array";
    let mut x = x.to_owned();
    let mut grad = Array::zeros(x.raw_dim());
    for index in indices_of(&x) {
        let index = index.into_dimension();
        let old = x[index.clone()];
        x[index.clone()] = old + h;
        let pos = f(&x)?;
        x[index.clone()] = old - h;
        let neg = f(&x)?;
        x[index.clone()] = old;
        ensure_shape!(
            pos.shape() == dout.shape(),
            OP,
            "output {:?} does not match dout {:?}",
            pos.shape(),
            dout.shape()
        );
        let sum = Zip::from(&pos)
            .and(&neg)
            .and(dout)
            .fold(T::zero(), |acc, &p, &n, &d| acc + (p - n) * d);
        grad[index] = sum / (h + h);
    }
    Ok(grad)
}

/// The maximum elementwise relative error between `x` and `y`.
///
/// Each element contributes `|x - y| / max(REL_ERROR_EPS, |x| + |y|)`.
///
/// **Errors**
///
/// The shapes are not equal.
pub fn rel_error<T, S1, S2, D>(x: &ArrayBase<S1, D>, y: &ArrayBase<S2, D>) -> Result<T>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    D: Dimension,
{
    ensure_shape!(
        x.shape() == y.shape(),
        "rel_error",
        "{:?} != {:?}",
        x.shape(),
        y.shape()
    );
    let eps = T::from_config(REL_ERROR_EPS);
    Ok(Zip::from(x).and(y).fold(T::zero(), |max, &x, &y| {
        max.max((x - y).abs() / (x.abs() + y.abs()).max(eps))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn numerical_gradient_of_square() -> anyhow::Result<()> {
        let x = array![1.0, -2.0, 3.0];
        let grad = eval_numerical_gradient(|x| Ok(x.mapv(|x| x * x).sum()), &x, 1e-5)?;
        assert_abs_diff_eq!(grad, array![2.0, -4.0, 6.0], epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn numerical_gradient_array_of_scale() -> anyhow::Result<()> {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let dout = array![[1.0, -1.0], [0.5, 2.0]];
        let grad = eval_numerical_gradient_array(|x| Ok(x * 3.0), &x, &dout, 1e-5)?;
        assert_abs_diff_eq!(grad, &dout * 3.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn numerical_gradient_array_shape_mismatch() {
        let x = array![1.0, 2.0];
        let dout = array![1.0, 2.0, 3.0];
        let result = eval_numerical_gradient_array(|x| Ok(x.clone()), &x, &dout, 1e-5);
        assert!(result.is_err());
    }

    #[test]
    fn rel_error_values() -> anyhow::Result<()> {
        let x = array![1.0f32, 2.0, 0.0];
        assert_eq!(rel_error(&x, &x)?, 0.0);
        let y = array![1.0f32, 3.0, 0.0];
        assert_abs_diff_eq!(rel_error(&x, &y)?, 0.2, epsilon = 1e-6);
        assert!(rel_error(&x, &array![1.0f32]).is_err());
        Ok(())
    }
}
