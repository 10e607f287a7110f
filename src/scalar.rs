use ndarray::ScalarOperand;
use num_traits::{Float, FromPrimitive};
use std::fmt::{Debug, Display};
use std::iter::Sum;

mod sealed {
    #[doc(hidden)]
    pub trait Sealed {}

    macro_rules! impl_sealed {
        ($($t:ty),+) => {
            $(
                impl Sealed for $t {}
            )+
        };
    }

    impl_sealed! {f32, f64}
}
use sealed::Sealed;

/// Float element types supported by the layers.
///
/// Implemented for [`f32`] and [`f64`]. Gradient checks should use [`f64`].
pub trait Scalar:
    Float
    + FromPrimitive
    + ScalarOperand
    + Sum
    + Default
    + Debug
    + Display
    + Send
    + Sync
    + Sealed
    + 'static
{
    /// Converts from an [`f64`] configuration value.
    fn from_config(x: f64) -> Self;
    /// Converts a count, for averaging.
    fn from_len(n: usize) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),+) => {
        $(
            impl Scalar for $t {
                fn from_config(x: f64) -> Self {
                    x as $t
                }
                fn from_len(n: usize) -> Self {
                    n as $t
                }
            }
        )+
    };
}

impl_scalar! {f32, f64}
