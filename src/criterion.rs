/*!
Classification losses.

Each loss takes scores x of shape (N, C) and labels y of shape (N,), with
`0 <= y[i] < C`, and returns the mean loss over the batch with its gradient dx.
*/
use crate::{
    error::{ensure_shape, LayerError, Result},
    scalar::Scalar,
};
use ndarray::{Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix1, Ix2};
use tracing::trace;

/// A loss over a batch of class scores.
pub trait Criterion<T: Scalar> {
    /// Computes (loss, dx).
    ///
    /// **Errors**
    ///
    /// The batch is empty, y does not have N labels, or a label is not a class.
    fn eval(&self, x: ArrayView2<T>, y: ArrayView1<usize>) -> Result<(T, Array2<T>)>;
}

/// Multiclass hinge loss with margin 1, see [`svm_loss`].
#[derive(Default, Clone, Copy, Debug)]
pub struct SvmLoss;

impl<T: Scalar> Criterion<T> for SvmLoss {
    fn eval(&self, x: ArrayView2<T>, y: ArrayView1<usize>) -> Result<(T, Array2<T>)> {
        check_labels("svm_loss", &x, &y)?;
        let count = T::from_len(x.nrows());
        let mut loss = T::zero();
        let mut dx = Array2::zeros(x.raw_dim());
        for ((x, mut dx), &label) in x.outer_iter().zip(dx.outer_iter_mut()).zip(y) {
            let correct = x[label];
            let mut positive = 0;
            for (class, (&x, dx)) in x.iter().zip(dx.iter_mut()).enumerate() {
                if class == label {
                    continue;
                }
                let margin = x - correct + T::one();
                if margin > T::zero() {
                    loss = loss + margin;
                    *dx = T::one() / count;
                    positive += 1;
                }
            }
            dx[label] = -T::from_len(positive) / count;
        }
        Ok((loss / count, dx))
    }
}

/// Softmax cross entropy, see [`softmax_loss`].
#[derive(Default, Clone, Copy, Debug)]
pub struct SoftmaxLoss;

impl<T: Scalar> Criterion<T> for SoftmaxLoss {
    fn eval(&self, x: ArrayView2<T>, y: ArrayView1<usize>) -> Result<(T, Array2<T>)> {
        check_labels("softmax_loss", &x, &y)?;
        let count = T::from_len(x.nrows());
        let mut loss = T::zero();
        let mut dx = Array2::zeros(x.raw_dim());
        for ((x, mut dx), &label) in x.outer_iter().zip(dx.outer_iter_mut()).zip(y) {
            let max = x.fold(T::neg_infinity(), |m, &x| m.max(x));
            dx.zip_mut_with(&x, |dx, &x| *dx = (x - max).exp());
            let sum = dx.sum();
            // log p = (x - max) - ln(sum)
            loss = loss + sum.ln() - (x[label] - max);
            dx.mapv_inplace(|p| p / sum / count);
            dx[label] = dx[label] - T::one() / count;
        }
        Ok((loss / count, dx))
    }
}

fn check_labels<T>(op: &'static str, x: &ArrayView2<T>, y: &ArrayView1<usize>) -> Result<()> {
    let (n, classes) = x.dim();
    ensure_shape!(n > 0, op, "the batch is empty");
    ensure_shape!(
        y.len() == n,
        op,
        "y has {} labels, x has {n} examples",
        y.len()
    );
    if let Some((index, &label)) = y.iter().enumerate().find(|&(_, &label)| label >= classes) {
        return Err(LayerError::Label {
            index,
            label,
            classes,
        });
    }
    Ok(())
}

/// Multiclass SVM loss.
///
/// For each example i, `margin_j = max(0, x[i, j] - x[i, y[i]] + 1)` for `j != y[i]`.
/// The loss is the sum of the margins, averaged over the batch. Each positive margin
/// adds 1 / N to its class in dx, and subtracts 1 / N from the correct class.
///
/// **Errors**
///
/// The batch is empty, y does not have N labels, or a label is not less than C.
pub fn svm_loss<T, S1, S2>(x: &ArrayBase<S1, Ix2>, y: &ArrayBase<S2, Ix1>) -> Result<(T, Array2<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = usize>,
{
    trace!(x = ?x.shape(), "svm_loss");
    SvmLoss.eval(x.view(), y.view())
}

/// Softmax cross entropy loss.
///
/// The scores of each example are shifted by their max before exponentiating. The
/// loss is the mean of `-ln p[i, y[i]]`, and dx is `(p - onehot(y)) / N`.
///
/// **Errors**
///
/// The batch is empty, y does not have N labels, or a label is not less than C.
pub fn softmax_loss<T, S1, S2>(
    x: &ArrayBase<S1, Ix2>,
    y: &ArrayBase<S2, Ix1>,
) -> Result<(T, Array2<T>)>
where
    T: Scalar,
    S1: Data<Elem = T>,
    S2: Data<Elem = usize>,
{
    trace!(x = ?x.shape(), "softmax_loss");
    SoftmaxLoss.eval(x.view(), y.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Axis};

    #[test]
    fn svm_loss_known() -> anyhow::Result<()> {
        let x = array![[1., 2., 3.], [3., 0., 0.5]];
        let y = array![0, 0];
        let (loss, dx) = svm_loss(&x, &y)?;
        // example 0: margins 2 and 3, example 1: none
        assert_abs_diff_eq!(loss, 2.5);
        assert_abs_diff_eq!(dx, array![[-1., 0.5, 0.5], [0., 0., 0.]]);
        Ok(())
    }

    #[test]
    fn svm_loss_separated() -> anyhow::Result<()> {
        let x = array![[5.0f32, 0., 1.], [0., 9., 2.]];
        let (loss, dx) = svm_loss(&x, &array![0, 1])?;
        assert_eq!(loss, 0.);
        assert!(dx.iter().all(|&dx| dx == 0.));
        Ok(())
    }

    #[test]
    fn softmax_loss_uniform() -> anyhow::Result<()> {
        let x = Array2::<f64>::zeros([4, 10]);
        let (loss, dx) = softmax_loss(&x, &array![0, 3, 5, 9])?;
        assert_abs_diff_eq!(loss, 10f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(dx[[1, 3]], (0.1 - 1.) / 4., epsilon = 1e-12);
        assert_abs_diff_eq!(dx[[1, 4]], 0.1 / 4., epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn softmax_loss_stable() -> anyhow::Result<()> {
        let x = array![[1000.0f32, 0., -1000.], [-5., 5., 1e4]];
        let (loss, dx) = softmax_loss(&x, &array![0, 2])?;
        assert!(loss.is_finite());
        assert_abs_diff_eq!(loss, 0., epsilon = 1e-6);
        for row_sum in dx.sum_axis(Axis(1)) {
            assert_abs_diff_eq!(row_sum, 0., epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn loss_errors() {
        let x = Array2::<f64>::zeros([2, 3]);
        assert!(matches!(
            svm_loss(&x, &array![0, 3]),
            Err(LayerError::Label {
                index: 1,
                label: 3,
                classes: 3
            })
        ));
        assert!(matches!(
            softmax_loss(&x, &array![0]),
            Err(LayerError::Shape { .. })
        ));
        let empty = Array2::<f64>::zeros([0, 3]);
        assert!(softmax_loss(&empty, &ndarray::Array1::<usize>::zeros(0)).is_err());
    }
}
