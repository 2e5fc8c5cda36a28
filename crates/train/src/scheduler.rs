//! Epoch-level learning rate schedule.

// ── MultiStep ───────────────────────────────────────────────────────────────

/// Step decay: `lr = base_lr · gamma^k`, where `k` is the number of
/// milestones that are `<= epoch`.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    epoch: usize,
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            epoch: 0,
            base_lr,
            milestones,
            gamma,
        }
    }

    /// Learning rate for the current epoch.
    pub fn current_lr(&self) -> f64 {
        let decays = self.milestones.iter().filter(|&&m| m <= self.epoch).count();
        self.base_lr * self.gamma.powi(decays as i32)
    }

    /// Called once at the end of every epoch.
    pub fn advance(&mut self) {
        self.epoch += 1;
    }

    /// Fast-forward to `epoch`, e.g. after resuming from a checkpoint.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
