//! The fixed two-layer classifier trained by the clients.
//!
//! The architecture never changes: [`INPUT_DIM`] inputs, one hidden layer
//! of [`HIDDEN_DIM`] ReLU units and [`NUM_CLASSES`] output logits. Its
//! parameters convert losslessly to and from [`ModelParameters`], which is
//! how they cross the process boundary to the coordinator.

use ndarray::{Array1, Array2, ArrayView1, Axis, Ix1, Ix2};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use fedpriv_core::model::{ModelParameters, HIDDEN_DIM, INPUT_DIM, NUM_CLASSES};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("the parameters do not match the fixed two-layer architecture")]
/// The received parameters have a different layout than the model.
pub struct LayoutError;

#[derive(Debug, Clone, PartialEq)]
/// A two-layer feed-forward classifier with a ReLU hidden layer.
pub struct Classifier {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl Classifier {
    /// Builds a classifier from wire parameters.
    ///
    /// # Errors
    /// Fails if the layout differs from the fixed architecture.
    pub fn from_parameters(params: ModelParameters) -> Result<Self, LayoutError> {
        let mut tensors = params.into_iter();
        let w1 = tensors
            .next()
            .ok_or(LayoutError)?
            .into_dimensionality::<Ix2>()
            .map_err(|_| LayoutError)?;
        let b1 = tensors
            .next()
            .ok_or(LayoutError)?
            .into_dimensionality::<Ix1>()
            .map_err(|_| LayoutError)?;
        let w2 = tensors
            .next()
            .ok_or(LayoutError)?
            .into_dimensionality::<Ix2>()
            .map_err(|_| LayoutError)?;
        let b2 = tensors
            .next()
            .ok_or(LayoutError)?
            .into_dimensionality::<Ix1>()
            .map_err(|_| LayoutError)?;
        let layout_ok = tensors.next().is_none()
            && w1.dim() == (HIDDEN_DIM, INPUT_DIM)
            && b1.dim() == HIDDEN_DIM
            && w2.dim() == (NUM_CLASSES, HIDDEN_DIM)
            && b2.dim() == NUM_CLASSES;
        if !layout_ok {
            return Err(LayoutError);
        }
        Ok(Self { w1, b1, w2, b2 })
    }

    /// Extracts the current parameters in wire layout.
    pub fn get_parameters(&self) -> ModelParameters {
        vec![
            self.w1.clone().into_dyn(),
            self.b1.clone().into_dyn(),
            self.w2.clone().into_dyn(),
            self.b2.clone().into_dyn(),
        ]
        .into()
    }

    /// Replaces the current parameters with the received ones.
    ///
    /// # Errors
    /// Fails if the layout differs from the fixed architecture. The
    /// current parameters are left untouched in that case.
    pub fn set_parameters(&mut self, params: ModelParameters) -> Result<(), LayoutError> {
        *self = Self::from_parameters(params)?;
        Ok(())
    }

    fn forward(&self, x: ArrayView1<f32>) -> (Array1<f32>, Array1<f32>) {
        let z1 = self.w1.dot(&x) + &self.b1;
        let a1 = z1.mapv(|v| v.max(0.0));
        let logits = self.w2.dot(&a1) + &self.b2;
        (a1, logits)
    }

    /// The predicted class for one example.
    pub fn predict(&self, x: ArrayView1<f32>) -> usize {
        let (_, logits) = self.forward(x);
        logits
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            })
            .0
    }

    /// The cross-entropy loss for one labeled example.
    pub fn loss(&self, x: ArrayView1<f32>, y: usize) -> f32 {
        let (_, logits) = self.forward(x);
        log_sum_exp(&logits) - logits[y]
    }

    /// The cross-entropy loss and its gradient for one labeled example.
    pub fn grad(&self, x: ArrayView1<f32>, y: usize) -> (f32, Gradients) {
        let (a1, logits) = self.forward(x);
        let lse = log_sum_exp(&logits);
        let loss = lse - logits[y];

        // d loss / d logits is the softmax with the label subtracted out
        let mut dlogits = logits.mapv(|v| (v - lse).exp());
        dlogits[y] -= 1.0;

        let gw2 = outer(&dlogits, &a1);
        let gb2 = dlogits.clone();
        let da1 = self.w2.t().dot(&dlogits);
        let dz1 = ndarray::Zip::from(&da1)
            .and(&a1)
            .map_collect(|&g, &a| if a > 0.0 { g } else { 0.0 });
        let gw1 = outer(&dz1, &x.to_owned());
        let gb1 = dz1;

        (loss, Gradients { gw1, gb1, gw2, gb2 })
    }

    /// One plain gradient descent step.
    pub fn apply_step(&mut self, grads: &Gradients, learning_rate: f32) {
        self.w1.scaled_add(-learning_rate, &grads.gw1);
        self.b1.scaled_add(-learning_rate, &grads.gb1);
        self.w2.scaled_add(-learning_rate, &grads.gw2);
        self.b2.scaled_add(-learning_rate, &grads.gb2);
    }
}

fn log_sum_exp(logits: &Array1<f32>) -> f32 {
    let max = logits.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    max + logits.mapv(|v| (v - max).exp()).sum().ln()
}

fn outer(a: &Array1<f32>, b: &Array1<f32>) -> Array2<f32> {
    let a = a.view().insert_axis(Axis(1));
    let b = b.view().insert_axis(Axis(0));
    a.dot(&b)
}

#[derive(Debug, Clone)]
/// The gradient of the loss with respect to every model parameter, in the
/// same shapes as the parameters themselves.
pub struct Gradients {
    pub gw1: Array2<f32>,
    pub gb1: Array1<f32>,
    pub gw2: Array2<f32>,
    pub gb2: Array1<f32>,
}

impl Gradients {
    /// All-zero gradients in the fixed architecture's shapes.
    pub fn zeros() -> Self {
        Self {
            gw1: Array2::zeros((HIDDEN_DIM, INPUT_DIM)),
            gb1: Array1::zeros(HIDDEN_DIM),
            gw2: Array2::zeros((NUM_CLASSES, HIDDEN_DIM)),
            gb2: Array1::zeros(NUM_CLASSES),
        }
    }

    /// The L2 norm over all entries, treated as one flat vector.
    pub fn l2_norm(&self) -> f32 {
        let squares = self.gw1.mapv(|v| v * v).sum()
            + self.gb1.mapv(|v| v * v).sum()
            + self.gw2.mapv(|v| v * v).sum()
            + self.gb2.mapv(|v| v * v).sum();
        squares.sqrt()
    }

    /// Scales every entry by `factor`.
    pub fn scale(&mut self, factor: f32) {
        self.gw1.mapv_inplace(|v| v * factor);
        self.gb1.mapv_inplace(|v| v * factor);
        self.gw2.mapv_inplace(|v| v * factor);
        self.gb2.mapv_inplace(|v| v * factor);
    }

    /// Adds `other` entry-wise.
    pub fn add(&mut self, other: &Self) {
        self.gw1 += &other.gw1;
        self.gb1 += &other.gb1;
        self.gw2 += &other.gw2;
        self.gb2 += &other.gb2;
    }

    /// Adds independent Gaussian noise to every entry.
    pub fn add_noise<R: Rng>(&mut self, rng: &mut R, noise: &Normal<f32>) {
        self.gw1.mapv_inplace(|v| v + noise.sample(rng));
        self.gb1.mapv_inplace(|v| v + noise.sample(rng));
        self.gw2.mapv_inplace(|v| v + noise.sample(rng));
        self.gb2.mapv_inplace(|v| v + noise.sample(rng));
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, ArrayD, IxDyn};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use rand_distr::StandardNormal;

    use super::*;
    use fedpriv_core::model::init_parameters;

    fn example(seed: u64) -> Array1<f32> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        Array1::from_iter((0..INPUT_DIM).map(|_| StandardNormal.sample(&mut rng)))
    }

    #[test]
    fn parameters_round_trip_unchanged() {
        let params = init_parameters(42);
        let model = Classifier::from_parameters(params.clone()).unwrap();
        assert_eq!(model.get_parameters(), params);
    }

    #[test]
    fn wrong_layouts_are_rejected() {
        assert_eq!(
            Classifier::from_parameters(ModelParameters::from(Vec::new())),
            Err(LayoutError)
        );

        let truncated: ModelParameters = init_parameters(0).into_iter().take(3).collect();
        assert_eq!(Classifier::from_parameters(truncated), Err(LayoutError));

        let wrong_width: ModelParameters = init_parameters(0)
            .into_iter()
            .map(|_| ArrayD::from_elem(IxDyn(&[2, 2]), 0.0f32))
            .collect();
        let mut model = Classifier::from_parameters(init_parameters(0)).unwrap();
        assert_eq!(model.set_parameters(wrong_width), Err(LayoutError));
        // a rejected update must not clobber the current parameters
        assert_eq!(model.get_parameters(), init_parameters(0));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut model = Classifier::from_parameters(init_parameters(7)).unwrap();
        let x = example(1);
        let y = 1;
        let (_, grads) = model.grad(x.view(), y);

        let h = 1e-3f32;
        for &(row, col) in &[(0, 0), (5, 12), (63, 29)] {
            let orig = model.w1[(row, col)];
            model.w1[(row, col)] = orig + h;
            let plus = model.loss(x.view(), y);
            model.w1[(row, col)] = orig - h;
            let minus = model.loss(x.view(), y);
            model.w1[(row, col)] = orig;

            let numeric = (plus - minus) / (2.0 * h);
            assert!(
                (numeric - grads.gw1[(row, col)]).abs() < 5e-3,
                "w1[{},{}]: numeric {} vs analytic {}",
                row,
                col,
                numeric,
                grads.gw1[(row, col)]
            );
        }
        for class in 0..NUM_CLASSES {
            let orig = model.b2[class];
            model.b2[class] = orig + h;
            let plus = model.loss(x.view(), y);
            model.b2[class] = orig - h;
            let minus = model.loss(x.view(), y);
            model.b2[class] = orig;

            let numeric = (plus - minus) / (2.0 * h);
            assert!(
                (numeric - grads.gb2[class]).abs() < 5e-3,
                "b2[{}]: numeric {} vs analytic {}",
                class,
                numeric,
                grads.gb2[class]
            );
        }
    }

    #[test]
    fn a_descent_step_reduces_the_loss() {
        let mut model = Classifier::from_parameters(init_parameters(3)).unwrap();
        let x = example(2);
        let y = 0;
        let (before, grads) = model.grad(x.view(), y);
        model.apply_step(&grads, 0.1);
        assert!(model.loss(x.view(), y) < before);
    }

    #[test]
    fn gradient_norms_clip_as_expected() {
        let model = Classifier::from_parameters(init_parameters(9)).unwrap();
        let (_, mut grads) = model.grad(example(4).view(), 1);
        let norm = grads.l2_norm();
        assert!(norm > 0.0);
        grads.scale(1.0 / norm);
        assert!((grads.l2_norm() - 1.0).abs() < 1e-4);
    }
}
