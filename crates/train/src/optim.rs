//! Optimisers over named Candle variables.
//!
//! Both keep their per-parameter state keyed by parameter name so the state
//! can be exported into a checkpoint and restored on resume.
//!
//! * [`SgdMomentum`]: `buf = μ·buf + g; θ -= lr·buf` (first step: `buf = g`).
//! * [`Adam`]: bias-corrected first/second moments, `θ -= lr·m̂ / (√v̂ + ε)`.

use candle_core::backprop::GradStore;
use candle_core::{Device, Result, Tensor, Var};

use crate::checkpoint::StateDict;

/// Common interface of the two workflow optimisers.
pub trait Optimizer {
    fn step(&mut self, grads: &GradStore) -> Result<()>;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
    /// Deep copy of the optimiser state.
    fn state_dict(&self) -> Result<StateDict>;
    /// Restore state written by [`Optimizer::state_dict`]. Parameters with no
    /// entry start from a fresh state.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

// ── SGD with momentum ───────────────────────────────────────────────────────

pub struct SgdMomentum {
    params: Vec<(String, Var)>,
    lr: f64,
    momentum: f64,
    buffers: StateDict,
}

impl SgdMomentum {
    pub fn new(params: Vec<(String, Var)>, lr: f64, momentum: f64) -> Self {
        Self {
            params,
            lr,
            momentum,
            buffers: StateDict::new(),
        }
    }

    fn buffer_key(name: &str) -> String {
        format!("{name}.momentum_buffer")
    }
}

impl Optimizer for SgdMomentum {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (name, var) in &self.params {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let buf = match self.buffers.get(name) {
                Some(prev) if self.momentum != 0.0 => prev.affine(self.momentum, 0.0)?.add(g)?,
                _ => g.clone(),
            };
            let buf = buf.detach();
            let next = var.as_tensor().sub(&buf.affine(self.lr, 0.0)?)?;
            var.set(&next)?;
            self.buffers.insert(name.clone(), buf);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> Result<StateDict> {
        self.buffers
            .iter()
            .map(|(name, buf)| Ok((Self::buffer_key(name), buf.copy()?)))
            .collect()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.buffers.clear();
        for (name, var) in &self.params {
            if let Some(buf) = state.get(&Self::buffer_key(name)) {
                self.buffers
                    .insert(name.clone(), buf.to_device(var.device())?.detach());
            }
        }
        Ok(())
    }
}

// ── Adam ────────────────────────────────────────────────────────────────────

/// Adam hyper-parameters (PyTorch defaults apart from `lr`).
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

pub struct Adam {
    params: Vec<(String, Var)>,
    config: ParamsAdam,
    step_t: u64,
    exp_avg: StateDict,
    exp_avg_sq: StateDict,
}

const STEP_KEY: &str = "step";

impl Adam {
    pub fn new(params: Vec<(String, Var)>, config: ParamsAdam) -> Self {
        Self {
            params,
            config,
            step_t: 0,
            exp_avg: StateDict::new(),
            exp_avg_sq: StateDict::new(),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step_t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.step_t as i32);
        let bias2 = 1.0 - beta2.powi(self.step_t as i32);

        for (name, var) in &self.params {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let m_prev = match self.exp_avg.get(name) {
                Some(m) => m.clone(),
                None => g.zeros_like()?,
            };
            let v_prev = match self.exp_avg_sq.get(name) {
                Some(v) => v.clone(),
                None => g.zeros_like()?,
            };
            let m = m_prev
                .affine(beta1, 0.0)?
                .add(&g.affine(1.0 - beta1, 0.0)?)?
                .detach();
            let v = v_prev
                .affine(beta2, 0.0)?
                .add(&g.sqr()?.affine(1.0 - beta2, 0.0)?)?
                .detach();

            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let denom = v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, eps)?;
            let update = m_hat.div(&denom)?.affine(lr, 0.0)?;
            var.set(&var.as_tensor().sub(&update)?)?;

            self.exp_avg.insert(name.clone(), m);
            self.exp_avg_sq.insert(name.clone(), v);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn state_dict(&self) -> Result<StateDict> {
        let mut state = StateDict::new();
        state.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_t as f64], &Device::Cpu)?,
        );
        for (name, m) in &self.exp_avg {
            state.insert(format!("{name}.exp_avg"), m.copy()?);
        }
        for (name, v) in &self.exp_avg_sq {
            state.insert(format!("{name}.exp_avg_sq"), v.copy()?);
        }
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        self.step_t = match state.get(STEP_KEY) {
            Some(t) => t.to_vec1::<f64>()?.first().copied().unwrap_or(0.0) as u64,
            None => 0,
        };
        self.exp_avg.clear();
        self.exp_avg_sq.clear();
        for (name, var) in &self.params {
            if let Some(m) = state.get(&format!("{name}.exp_avg")) {
                self.exp_avg
                    .insert(name.clone(), m.to_device(var.device())?.detach());
            }
            if let Some(v) = state.get(&format!("{name}.exp_avg_sq")) {
                self.exp_avg_sq
                    .insert(name.clone(), v.to_device(var.device())?.detach());
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_var(v: f32) -> Var {
        Var::new(&[v], &Device::Cpu).unwrap()
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    /// Gradient of `2·θ` is a constant 2.
    fn grads_of_linear(var: &Var) -> GradStore {
        var.as_tensor()
            .affine(2.0, 0.0)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap()
    }

    #[test]
    fn sgd_momentum_update_rule() {
        let p = scalar_var(1.0);
        let mut opt = SgdMomentum::new(vec![("p".into(), p.clone())], 0.1, 0.9);

        opt.step(&grads_of_linear(&p)).unwrap();
        assert!((value(&p) - 0.8).abs() < 1e-6);

        // buf = 0.9 * 2 + 2 = 3.8
        opt.step(&grads_of_linear(&p)).unwrap();
        assert!((value(&p) - 0.42).abs() < 1e-6);
    }

    #[test]
    fn sgd_state_round_trip() {
        let p = scalar_var(1.0);
        let mut opt = SgdMomentum::new(vec![("p".into(), p.clone())], 0.1, 0.9);
        opt.step(&grads_of_linear(&p)).unwrap();
        let state = opt.state_dict().unwrap();
        assert_eq!(
            state["p.momentum_buffer"].to_vec1::<f32>().unwrap(),
            vec![2.0]
        );

        let q = scalar_var(0.8);
        let mut resumed = SgdMomentum::new(vec![("p".into(), q.clone())], 0.1, 0.9);
        resumed.load_state_dict(&state).unwrap();
        resumed.step(&grads_of_linear(&q)).unwrap();
        opt.step(&grads_of_linear(&p)).unwrap();
        assert!((value(&p) - value(&q)).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let p = scalar_var(1.0);
        let mut opt = Adam::new(vec![("p".into(), p.clone())], ParamsAdam::default());
        opt.step(&grads_of_linear(&p)).unwrap();
        assert!((value(&p) - 0.999).abs() < 1e-6);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn adam_state_round_trip() {
        let p = scalar_var(1.0);
        let mut opt = Adam::new(vec![("p".into(), p.clone())], ParamsAdam::default());
        opt.step(&grads_of_linear(&p)).unwrap();
        opt.step(&grads_of_linear(&p)).unwrap();
        let state = opt.state_dict().unwrap();

        let q = Var::from_tensor(&p.as_tensor().copy().unwrap()).unwrap();
        let mut resumed = Adam::new(vec![("p".into(), q.clone())], ParamsAdam::default());
        resumed.load_state_dict(&state).unwrap();
        assert_eq!(resumed.step_count(), 2);

        opt.step(&grads_of_linear(&p)).unwrap();
        resumed.step(&grads_of_linear(&q)).unwrap();
        assert!((value(&p) - value(&q)).abs() < 1e-7);
    }

    #[test]
    fn learning_rate_is_settable() {
        let mut opt = SgdMomentum::new(vec![], 0.05, 0.9);
        opt.set_learning_rate(0.005);
        assert_eq!(opt.learning_rate(), 0.005);
    }
}
