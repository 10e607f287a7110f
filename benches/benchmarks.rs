use convnet_layers::{
    layer::{
        batch_norm::{spatial_batchnorm_forward, BatchNormParam, RunningStats},
        conv::{conv_backward_naive, conv_forward_naive, ConvParam},
        pool::{max_pool_backward_naive, max_pool_forward_naive, PoolParam},
    },
    Scalar,
};
use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::{Array, Array1, Array4};
use std::any::type_name;

fn input<T: Scalar>(shape: [usize; 4]) -> Array4<T> {
    let len = shape.iter().product::<usize>();
    Array::linspace(-1., 1., len)
        .mapv(T::from_config)
        .into_shape(shape)
        .unwrap()
}

fn conv_benches<T: Scalar>(c: &mut Criterion) {
    let shapes = [
        ([8, 3, 32, 32], [16, 3, 3, 3]),
        ([8, 16, 16, 16], [32, 16, 3, 3]),
    ];
    for (x_shape, w_shape) in shapes {
        let x = input::<T>(x_shape);
        let w = input::<T>(w_shape);
        let b = Array1::zeros(w_shape[0]);
        let param = ConvParam::default().with_pad(1);
        let name = format!("conv {x_shape:?} {w_shape:?} {}", type_name::<T>());
        c.bench_function(&format!("{name} forward"), |bencher| {
            bencher.iter(|| conv_forward_naive(&x, &w, &b, &param).unwrap());
        });
        c.bench_function(&format!("{name} backward"), |bencher| {
            let (y, cache) = conv_forward_naive(&x, &w, &b, &param).unwrap();
            bencher.iter(|| conv_backward_naive(&y, cache.clone()).unwrap());
        });
    }
}

fn pool_benches<T: Scalar>(c: &mut Criterion) {
    let x = input::<T>([8, 16, 32, 32]);
    let param = PoolParam::default();
    let name = format!("max_pool {:?} {}", x.shape(), type_name::<T>());
    c.bench_function(&format!("{name} forward"), |bencher| {
        bencher.iter(|| max_pool_forward_naive(&x, &param).unwrap());
    });
    c.bench_function(&format!("{name} backward"), |bencher| {
        let (y, cache) = max_pool_forward_naive(&x, &param).unwrap();
        bencher.iter(|| max_pool_backward_naive(&y, cache.clone()).unwrap());
    });
}

fn batch_norm_benches<T: Scalar>(c: &mut Criterion) {
    let x = input::<T>([8, 16, 32, 32]);
    let gamma = Array1::ones(16);
    let beta = Array1::zeros(16);
    let param = BatchNormParam::default();
    let mut running = RunningStats::new();
    c.bench_function(
        &format!("spatial_batchnorm {:?} {} forward", x.shape(), type_name::<T>()),
        |bencher| {
            bencher.iter(|| {
                spatial_batchnorm_forward(&x, &gamma, &beta, &param, &mut running).unwrap()
            });
        },
    );
}

pub fn criterion_benchmark(c: &mut Criterion) {
    conv_benches::<f32>(c);
    conv_benches::<f64>(c);
    pool_benches::<f32>(c);
    batch_norm_benches::<f32>(c);
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
