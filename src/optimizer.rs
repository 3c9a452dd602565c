use candle_core::{Result, Tensor, Var};
use candle_nn::optim::Optimizer;
use candle_nn::{AdamW, ParamsAdamW, VarMap};

/// AdamW with elementwise gradient clamping. `global_step` counts
/// minibatch updates and is the only record of optimization progress.
pub struct ClippedAdamW {
    adam: AdamW,
    vars: Vec<Var>,
    clip: f64,
    global_step: usize,
}

impl ClippedAdamW {
    pub fn new(varmap: &VarMap, learning_rate: f64) -> Result<Self> {
        let vars = varmap.all_vars();
        let adam = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: learning_rate,
                ..Default::default()
            },
        )?;
        Ok(Self {
            adam,
            vars,
            clip: 1.0,
            global_step: 0,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Restore the step counter when resuming a run.
    pub fn set_global_step(&mut self, step: usize) {
        self.global_step = step;
    }

    /// Backpropagate, clamp every gradient into `[-1, 1]`, apply one
    /// update, and advance the step counter.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let mut grads = loss.backward()?;
        for var in &self.vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, grad.clamp(-self.clip, self.clip)?);
            }
        }
        self.adam.step(&grads)?;
        self.global_step += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn steps_update_parameters_and_the_counter() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vs.get_with_hints(3, "w", candle_nn::Init::Const(5.0))?;

        let mut opt = ClippedAdamW::new(&varmap, 0.1)?;
        assert_eq!(opt.global_step(), 0);

        let mut last = f32::INFINITY;
        for _ in 0..20 {
            let loss = w.sqr()?.sum_all()?;
            let value = loss.to_scalar::<f32>()?;
            assert!(value <= last + 1e-3);
            last = value;
            opt.backward_step(&loss)?;
        }
        assert_eq!(opt.global_step(), 20);
        assert!(last < 75.0);
        Ok(())
    }

    #[test]
    fn huge_gradients_still_take_bounded_steps() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vs.get_with_hints(1, "w", candle_nn::Init::Const(1.0))?;

        let mut opt = ClippedAdamW::new(&varmap, 0.01)?;
        let loss = (w.sqr()? * 1e8)?.sum_all()?;
        opt.backward_step(&loss)?;
        let after = w.to_vec1::<f32>()?[0];
        assert!(after.is_finite());
        assert!((after - 1.0).abs() < 0.1);
        Ok(())
    }

    #[test]
    fn counter_can_be_restored() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _w = vs.get_with_hints(1, "w", candle_nn::Init::Const(0.0))?;
        let mut opt = ClippedAdamW::new(&varmap, 0.01)?;
        opt.set_global_step(1234);
        assert_eq!(opt.global_step(), 1234);
        Ok(())
    }
}
