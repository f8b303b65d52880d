//! Optimizer trait

/// Trait for optimization algorithms.
///
/// Parameters are addressed by a stable `slot` index so that optimizers can
/// keep per-parameter state (moments, velocities) across steps: callers
/// assign one slot per weight tensor and keep the assignment fixed for the
/// lifetime of a fit.
pub trait Optimizer {
    /// Apply one update to a parameter given its gradient.
    ///
    /// `param` and `grad` are flat views of the same tensor; they must have
    /// equal length.
    fn update(&mut self, slot: usize, param: &mut [f32], grad: &[f32]);

    /// Get learning rate.
    fn lr(&self) -> f32;

    /// Set learning rate.
    fn set_lr(&mut self, lr: f32);

    /// Drop all per-parameter state (moments, velocities), e.g. when the
    /// parameter set changes between fits.
    fn reset(&mut self) {}
}
