use burn::tensor::{backend::Backend, Tensor};

/// Bilinear resize of a `[N, C, H, W]` tensor with aligned corners.
///
/// Output index `i` samples the source at `i * (in - 1) / (out - 1)`, so the
/// first and last pixels of both grids coincide. burn's `interpolate` does not
/// expose corner alignment, so the resize is written as two interpolation
/// matrix products, which keeps it differentiable on every backend.
pub fn resize_bilinear<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    let [out_h, out_w] = size;
    if h == out_h && w == out_w {
        return x;
    }

    let device = x.device();

    // [out_h, h] applied from the left, [w, out_w] from the right, both
    // broadcast over the batch and channel dims
    let rows = interpolation_matrix::<B>(h, out_h, &device).unsqueeze::<4>();
    let cols = interpolation_matrix::<B>(w, out_w, &device)
        .transpose()
        .unsqueeze::<4>();

    rows.matmul(x).matmul(cols)
}

/// Row-stochastic `[output, input]` matrix of aligned-corner linear weights.
fn interpolation_matrix<B: Backend>(
    input: usize,
    output: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let weights = interpolation_weights(input, output);
    Tensor::<B, 1>::from_floats(weights.as_slice(), device).reshape([output, input])
}

fn interpolation_weights(input: usize, output: usize) -> Vec<f32> {
    let mut weights = vec![0.0_f32; output * input];
    if input == 0 {
        return weights;
    }

    let last = input - 1;
    let scale = if output > 1 {
        last as f64 / (output - 1) as f64
    } else {
        0.0
    };

    for i in 0..output {
        let src = i as f64 * scale;
        let lo = (src.floor() as usize).min(last);
        let hi = (lo + 1).min(last);
        let frac = (src - lo as f64) as f32;
        weights[i * input + lo] += 1.0 - frac;
        weights[i * input + hi] += frac;
    }
    weights
}
