/*!
# convnet-layers
Forward and backward passes of the building blocks of a convolutional network, on
[`ndarray`] arrays.

- [`layer::affine`], [`layer::relu`], [`layer::batch_norm`], [`layer::dropout`]
- [`layer::conv`] and [`layer::pool`], as direct sliding window loops
- [`layer::composite`] layers chaining the above
- [`criterion::svm_loss`] and [`criterion::softmax_loss`]
- [`gradient_check`] helpers that validate a backward pass with finite differences

Every forward function returns its output and a cache. The matching backward function
takes the upstream gradient and that cache by value, and returns the gradients with the
shapes of the forward inputs.

```
use convnet_layers::layer::conv::{conv_backward_naive, conv_forward_naive, ConvParam};
use ndarray::{Array1, Array4};

# fn main() -> convnet_layers::error::Result<()> {
let x = Array4::<f32>::ones([2, 3, 8, 8]);
let w = Array4::<f32>::ones([4, 3, 3, 3]);
let b = Array1::<f32>::zeros(4);
let param = ConvParam::default().with_pad(1);
let (y, cache) = conv_forward_naive(&x, &w, &b, &param)?;
assert_eq!(y.dim(), (2, 4, 8, 8));
let (dx, dw, db) = conv_backward_naive(&y, cache)?;
assert_eq!(dx.dim(), x.dim());
assert_eq!(dw.dim(), w.dim());
assert_eq!(db.len(), 4);
# Ok(())
# }
```

The library emits [`tracing`] events and installs no subscriber.
*/
#![warn(missing_docs)]

pub mod criterion;
/// Errors.
pub mod error;
pub mod gradient_check;
pub mod layer;
/// Float types.
pub mod scalar;

pub use error::{LayerError, Result};
pub use scalar::Scalar;
