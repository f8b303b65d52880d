//! Epoch-boundary hooks
//!
//! The training loop invokes each hook after every epoch with read/write
//! access to the model, so a hook can mutate layer state between epochs (the
//! progressive-sparsification strategy grows its connectivity mask this way).

use crate::nn::Model;

/// Hook invoked at every epoch boundary of a training run.
pub trait EpochHook {
    /// Called after each epoch with the just-trained model.
    fn on_epoch_end(&mut self, epoch: usize, model: &mut Model);

    /// Hook name for logging.
    fn name(&self) -> &'static str {
        "EpochHook"
    }
}
