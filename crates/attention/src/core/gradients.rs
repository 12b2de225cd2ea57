//! Gradient accumulation across per-step backward passes.
//!
//! Each decode step is differentiated on its own, producing a candle
//! [`GradStore`]. [`Gradients`] keeps an explicit watch-list of variables and
//! sums whatever each store holds for them, discarding every other entry.

use std::collections::HashMap;

use candle_core::{backprop::GradStore, Tensor, TensorId, Var};

use super::errors::{AttentionError, Result};

/// Accumulated gradients keyed by variable identity.
#[derive(Debug, Default)]
pub struct Gradients {
    watched: HashMap<TensorId, Tensor>,
    grads: HashMap<TensorId, Tensor>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator watching every variable in `vars`.
    pub fn watching(vars: &[Var]) -> Self {
        let mut grads = Self::new();
        grads.watch_all(vars);
        grads
    }

    /// Starts collecting gradients for `tensor`.
    pub fn watch(&mut self, tensor: &Tensor) {
        self.watched.insert(tensor.id(), tensor.clone());
    }

    pub fn watch_all(&mut self, vars: &[Var]) {
        for var in vars {
            self.watch(var.as_tensor());
        }
    }

    pub fn is_watched(&self, tensor: &Tensor) -> bool {
        self.watched.contains_key(&tensor.id())
    }

    /// Stops watching `tensor` and returns whatever was accumulated for it.
    pub fn unwatch(&mut self, tensor: &Tensor) -> Option<Tensor> {
        self.watched.remove(&tensor.id());
        self.grads.remove(&tensor.id())
    }

    pub fn get(&self, tensor: &Tensor) -> Option<&Tensor> {
        self.grads.get(&tensor.id())
    }

    pub fn remove(&mut self, tensor: &Tensor) -> Option<Tensor> {
        self.grads.remove(&tensor.id())
    }

    /// Adds `grad` into the entry for `tensor`, which must be watched.
    pub fn accumulate(&mut self, tensor: &Tensor, grad: Tensor) -> Result<()> {
        if !self.is_watched(tensor) {
            return Ok(());
        }
        if grad.dims() != tensor.dims() {
            return Err(AttentionError::shape(format!(
                "gradient shape {:?} does not match variable shape {:?}",
                grad.dims(),
                tensor.dims()
            )));
        }
        // stored gradients never carry autograd history
        let grad = grad.detach();
        let id = tensor.id();
        let merged = match self.grads.remove(&id) {
            Some(existing) => existing.add(&grad)?.detach(),
            None => grad,
        };
        self.grads.insert(id, merged);
        Ok(())
    }

    /// Moves the watched entries out of `store` and sums them in.
    pub fn absorb(&mut self, store: &mut GradStore) -> Result<()> {
        let taken = self
            .watched
            .values()
            .filter_map(|tensor| store.remove(tensor).map(|grad| (tensor.clone(), grad)))
            .collect::<Vec<_>>();
        for (tensor, grad) in taken {
            self.accumulate(&tensor, grad)?;
        }
        Ok(())
    }

    /// Number of variables holding a gradient.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Drops accumulated values but keeps the watch-list.
    pub fn clear(&mut self) {
        self.grads.clear();
    }
}
