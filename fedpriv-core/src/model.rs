//! Model parameter representation shared by the coordinator and the clients.

use std::{
    iter::{FromIterator, IntoIterator},
    slice::{Iter, IterMut},
};

use derive_more::{From, Index, IndexMut, Into};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// The number of input features of the demo classifier.
pub const INPUT_DIM: usize = 30;
/// The width of the hidden layer.
pub const HIDDEN_DIM: usize = 64;
/// The number of output classes.
pub const NUM_CLASSES: usize = 2;

#[derive(Debug, Clone, PartialEq, From, Index, IndexMut, Into, Serialize, Deserialize)]
/// The weights and biases of the model, one tensor per learnable layer.
///
/// The layout (number, ordering and shapes of the tensors) is fixed by the
/// model architecture and is identical across every client and the
/// coordinator's global copy. Only the numeric values differ between
/// rounds: parameters travel by value on every round boundary, never by
/// reference, since the clients and the coordinator are separate
/// processes.
pub struct ModelParameters(Vec<ArrayD<f32>>);

impl ModelParameters {
    /// Gets the number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Creates an iterator that yields references to the layer tensors.
    pub fn iter(&self) -> Iter<ArrayD<f32>> {
        self.0.iter()
    }

    /// Creates an iterator that yields mutable references to the layer tensors.
    pub fn iter_mut(&mut self) -> IterMut<ArrayD<f32>> {
        self.0.iter_mut()
    }

    /// The shape of every tensor, in layer order.
    pub fn shapes(&self) -> Vec<&[usize]> {
        self.0.iter().map(|t| t.shape()).collect()
    }

    /// Checks whether `other` has the same number of tensors with the same
    /// shapes, in the same order.
    pub fn same_layout(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.shape() == b.shape())
    }
}

impl FromIterator<ArrayD<f32>> for ModelParameters {
    fn from_iter<I: IntoIterator<Item = ArrayD<f32>>>(iter: I) -> Self {
        let tensors: Vec<ArrayD<f32>> = iter.into_iter().collect();
        ModelParameters(tensors)
    }
}

impl IntoIterator for ModelParameters {
    type Item = ArrayD<f32>;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Freshly initialized parameters for the fixed two-layer architecture:
/// [`INPUT_DIM`] inputs, one hidden layer of [`HIDDEN_DIM`] units and
/// [`NUM_CLASSES`] output logits.
///
/// Weights are drawn uniformly from `(-1/sqrt(fan_in), 1/sqrt(fan_in))`
/// with a seeded generator, so the same seed yields the same parameters in
/// every process.
pub fn init_parameters(seed: u64) -> ModelParameters {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let layers = [(HIDDEN_DIM, INPUT_DIM), (NUM_CLASSES, HIDDEN_DIM)];
    let mut tensors = Vec::with_capacity(2 * layers.len());
    for &(rows, cols) in layers.iter() {
        let bound = 1.0 / (cols as f32).sqrt();
        let dist = Uniform::new(-bound, bound);
        tensors.push(ArrayD::random_using(IxDyn(&[rows, cols]), dist, &mut rng));
        tensors.push(ArrayD::random_using(IxDyn(&[rows]), dist, &mut rng));
    }
    ModelParameters(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_parameters_layout() {
        let params = init_parameters(42);
        assert_eq!(params.len(), 4);
        assert_eq!(
            params.shapes(),
            vec![
                &[HIDDEN_DIM, INPUT_DIM][..],
                &[HIDDEN_DIM][..],
                &[NUM_CLASSES, HIDDEN_DIM][..],
                &[NUM_CLASSES][..],
            ]
        );
    }

    #[test]
    fn init_parameters_deterministic() {
        assert_eq!(init_parameters(7), init_parameters(7));
        assert_ne!(init_parameters(7), init_parameters(8));
    }

    #[test]
    fn same_layout() {
        let a = init_parameters(0);
        let b = init_parameters(1);
        assert!(a.same_layout(&b));

        let truncated: ModelParameters = a.clone().into_iter().take(3).collect();
        assert!(!a.same_layout(&truncated));
    }
}
