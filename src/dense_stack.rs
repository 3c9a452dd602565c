use crate::distributions::ParamSpec;

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Linear, Module, ModuleT, VarBuilder, ops};

/// Fully connected trunk shared by encoders and decoders: a chain of
/// linear layers with ReLU, optional batch normalisation after every
/// layer, and dropout applied in training mode only. The input dropout
/// rate covers the trunk's input, the hidden rate every layer output.
pub struct DenseStack {
    layers: Vec<Linear>,
    batch_norms: Vec<Option<BatchNorm>>,
    input_dropout_rate: f32,
    hidden_dropout_rate: f32,
    dim_in: usize,
    dim_out: usize,
}

impl DenseStack {
    /// Variables are registered as `{prefix}.fc.{j}.{weight,bias}` and
    /// `{prefix}.bn.{j}.*` under `vs`.
    pub fn new(
        dim_in: usize,
        hidden: &[usize],
        batch_normalisation: bool,
        input_dropout_rate: f32,
        hidden_dropout_rate: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let bn_config = candle_nn::BatchNormConfig {
            eps: 1e-4,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        };

        let mut layers = Vec::with_capacity(hidden.len());
        let mut batch_norms = Vec::with_capacity(hidden.len());
        let mut prev_dim = dim_in;
        for (j, &next_dim) in hidden.iter().enumerate() {
            layers.push(candle_nn::linear(
                prev_dim,
                next_dim,
                vs.pp(format!("fc.{}", j)),
            )?);
            batch_norms.push(if batch_normalisation {
                Some(candle_nn::batch_norm(
                    next_dim,
                    bn_config,
                    vs.pp(format!("bn.{}", j)),
                )?)
            } else {
                None
            });
            prev_dim = next_dim;
        }

        Ok(Self {
            layers,
            batch_norms,
            input_dropout_rate,
            hidden_dropout_rate,
            dim_in,
            dim_out: prev_dim,
        })
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }
}

impl ModuleT for DenseStack {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = if train && self.input_dropout_rate > 0.0 {
            ops::dropout(input, self.input_dropout_rate)?
        } else {
            input.clone()
        };
        for (layer, bn) in self.layers.iter().zip(self.batch_norms.iter()) {
            x = layer.forward(&x)?.relu()?;
            if let Some(bn) = bn {
                x = bn.forward_t(&x, train)?;
            }
            if train && self.hidden_dropout_rate > 0.0 {
                x = ops::dropout(&x, self.hidden_dropout_rate)?;
            }
        }
        Ok(x)
    }
}

/// Output head for one distribution parameter: dropout on the trunk
/// output, a linear map, then the parameter's activation clipped into
/// its open support.
pub struct ParamHead {
    linear: Linear,
    spec: ParamSpec,
    dropout_rate: f32,
}

impl ParamHead {
    pub fn new(dim_in: usize, dim_out: usize, spec: ParamSpec, vs: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(dim_in, dim_out, vs.pp(spec.name.replace(' ', "_")))?;
        Ok(Self {
            linear,
            spec,
            dropout_rate: 0.0,
        })
    }

    pub fn with_dropout(mut self, rate: f32) -> Self {
        self.dropout_rate = rate;
        self
    }

    pub fn spec(&self) -> &ParamSpec {
        &self.spec
    }
}

impl ModuleT for ParamHead {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let x = if train && self.dropout_rate > 0.0 {
            ops::dropout(input, self.dropout_rate)?
        } else {
            input.clone()
        };
        let raw = self.linear.forward(&x)?;
        self.spec.activation.apply(&raw, self.spec.support)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::ParamActivation;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn builder(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn stack_maps_through_hidden_sizes() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let stack = DenseStack::new(7, &[5, 3], false, 0.0, 0.0, builder(&varmap).pp("enc"))?;
        assert_eq!(stack.dim_in(), 7);
        assert_eq!(stack.dim_out(), 3);
        let x = Tensor::randn(0f32, 1f32, (4, 7), &Device::Cpu)?;
        let h = stack.forward_t(&x, true)?;
        assert_eq!(h.dims(), &[4, 3]);
        Ok(())
    }

    #[test]
    fn empty_stack_is_identity_width() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let stack = DenseStack::new(7, &[], false, 0.0, 0.0, builder(&varmap).pp("enc"))?;
        assert_eq!(stack.dim_out(), 7);
        let x = Tensor::randn(0f32, 1f32, (2, 7), &Device::Cpu)?;
        let h = stack.forward_t(&x, false)?;
        assert_eq!(h.dims(), &[2, 7]);
        Ok(())
    }

    #[test]
    fn batch_norm_stack_runs_in_both_modes() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let stack = DenseStack::new(4, &[6], true, 0.0, 0.1, builder(&varmap).pp("enc"))?;
        let x = Tensor::randn(0f32, 1f32, (8, 4), &Device::Cpu)?;
        assert_eq!(stack.forward_t(&x, true)?.dims(), &[8, 6]);
        assert_eq!(stack.forward_t(&x, false)?.dims(), &[8, 6]);
        Ok(())
    }

    #[test]
    fn input_dropout_zeroes_features_in_training_mode_only() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        // no hidden layers, so the trunk output is the (dropped) input
        let stack = DenseStack::new(50, &[], false, 0.5, 0.0, builder(&varmap).pp("enc"))?;
        let x = Tensor::ones((4, 50), DType::F32, &Device::Cpu)?;
        let trained = stack.forward_t(&x, true)?;
        let zeros = trained
            .eq(0f64)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert!(zeros > 0.0, "training mode should drop some inputs");
        let evaluated = stack.forward_t(&x, false)?;
        let diff = evaluated.sub(&x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "eval mode must pass the input through");
        Ok(())
    }

    #[test]
    fn head_respects_parameter_support() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let spec = ParamSpec {
            name: "probabilities",
            support: (0.0, 1.0),
            activation: ParamActivation::Sigmoid,
            init: 0.5,
        };
        let head = ParamHead::new(3, 5, spec, builder(&varmap).pp("dec"))?;
        let x = (Tensor::randn(0f32, 1f32, (6, 3), &Device::Cpu)? * 100.0)?;
        let p = head.forward_t(&x, false)?;
        let flat = p.flatten_all()?.to_vec1::<f32>()?;
        for v in flat {
            assert!(v > 0.0 && v < 1.0);
        }
        Ok(())
    }
}
