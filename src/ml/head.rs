use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::FloatDType,
};

/// Wraps the output projection so logits always come out as f32,
/// whatever float element the backend runs in (f16 under `--fp16`).
/// The softmax in the loss is then computed at full precision.
#[derive(Module, Debug)]
pub struct CastOutputToFloat<B: Backend> {
    pub inner: Linear<B>,
}

impl<B: Backend> CastOutputToFloat<B> {
    pub fn new(d_model: usize, vocab_size: usize, device: &B::Device) -> Self {
        let inner = LinearConfig::new(d_model, vocab_size).with_bias(false).init(device);
        Self { inner }
    }

    /// x: [batch, seq_len, d_model] → logits: [batch, seq_len, vocab] in f32
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.inner.forward(x).cast(FloatDType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::DType;

    #[test]
    fn test_logits_are_f32_on_f64_backend() {
        type B = NdArray<f64>;
        let device = Default::default();
        let head = CastOutputToFloat::<B>::new(4, 7, &device);
        let x = Tensor::<B, 3>::ones([2, 3, 4], &device);
        assert_eq!(x.dtype(), DType::F64);

        let logits = head.forward(x);
        assert_eq!(logits.dims(), [2, 3, 7]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn test_logits_stay_f32_on_f32_backend() {
        type B = NdArray;
        let device = Default::default();
        let head = CastOutputToFloat::<B>::new(4, 5, &device);
        let logits = head.forward(Tensor::<B, 3>::zeros([1, 2, 4], &device));
        assert_eq!(logits.dtype(), DType::F32);
    }
}
