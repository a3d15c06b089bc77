use burn::config::Config;
use burn::module::{Content, DisplaySettings, Module, ModuleDisplay};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::{Reduction, len_to_weights, one_hot_1d};

/// Configuration to create a [cross-entropy loss](CrossEntropyLoss).
#[derive(Config, Debug)]
pub struct CrossEntropyLossConfig {
    /// Label smoothing factor in `[0, 1)`. The one-hot targets become
    /// `onehot * (1 - smoothing) + smoothing / num_classes`.
    #[config(default = 0.0)]
    pub smoothing: f32,
}

impl CrossEntropyLossConfig {
    /// Initialize [cross-entropy loss](CrossEntropyLoss).
    pub fn init(&self) -> CrossEntropyLoss {
        self.assertions();
        log::debug!("Cross-entropy loss with label smoothing {}", self.smoothing);

        CrossEntropyLoss {
            smoothing: self.smoothing,
        }
    }

    fn assertions(&self) {
        assert!(
            (0.0..1.0).contains(&self.smoothing),
            "Label smoothing must be in [0, 1), got {}.",
            self.smoothing
        );
    }
}

/// Softmax cross-entropy between logits and class targets.
///
/// Handles plain classification (`[batch_size, num_classes]` logits) as well as sequence
/// classification (`[batch_size, seq_length, num_classes]` logits) where positions past each
/// target length are excluded through zero weights.
#[derive(Module, Debug, Clone)]
#[module(custom_display)]
pub struct CrossEntropyLoss {
    /// Label smoothing factor.
    pub smoothing: f32,
}

impl ModuleDisplay for CrossEntropyLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content.add("smoothing", &self.smoothing).optional()
    }
}

impl CrossEntropyLoss {
    /// Compute the criterion from class indices.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes]`
    /// - targets: `[batch_size]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let loss = self.forward_no_reduction(logits, targets);
        reduction.reduce(loss, None)
    }

    /// Compute the criterion from target distributions (one-hot or soft labels).
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes]`
    /// - targets: `[batch_size, num_classes]`
    /// - output: `[1]`
    pub fn forward_probs<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 2>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let loss = self.forward_probs_no_reduction(logits, targets);
        reduction.reduce(loss, None)
    }

    /// Compute the criterion for every position of a batch of sequences and reduce it.
    ///
    /// When `target_lengths` is given, positions `t >= target_lengths[b]` get a zero weight.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, seq_length, num_classes]`
    /// - targets: `[batch_size, seq_length]`
    /// - target_lengths: `[batch_size]`
    /// - output: `[1]`
    pub fn forward_sequence<B: Backend>(
        &self,
        logits: Tensor<B, 3>,
        targets: Tensor<B, 2, Int>,
        target_lengths: Option<Tensor<B, 1, Int>>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let [_, seq_length, _] = logits.dims();
        let loss = self.forward_sequence_no_reduction(logits, targets);
        let weights = target_lengths.map(|lengths| len_to_weights(lengths, seq_length));

        reduction.reduce(loss, weights)
    }

    /// Per-example loss from class indices.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes]`
    /// - targets: `[batch_size]`
    /// - output: `[batch_size]`
    pub fn forward_no_reduction<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [batch_size, num_classes] = logits.dims();
        let [target_batch] = targets.dims();
        assert_eq!(
            batch_size, target_batch,
            "Logits and targets must have the same batch size."
        );

        let targets = one_hot_1d(targets, num_classes);
        self.forward_probs_no_reduction(logits, targets)
    }

    /// Per-example loss from target distributions.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes]`
    /// - targets: `[batch_size, num_classes]`
    /// - output: `[batch_size]`
    pub fn forward_probs_no_reduction<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        assert_eq!(
            logits.dims(),
            targets.dims(),
            "Logits and target distributions must have the same shape."
        );
        let [batch_size, num_classes] = logits.dims();

        let targets = self.smooth(targets, num_classes);
        let log_probs = log_softmax(logits, 1);

        (log_probs * targets)
            .sum_dim(1)
            .reshape([batch_size])
            .neg()
    }

    /// Per-position loss of a batch of sequences.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, seq_length, num_classes]`
    /// - targets: `[batch_size, seq_length]`
    /// - output: `[batch_size, seq_length]`
    pub fn forward_sequence_no_reduction<B: Backend>(
        &self,
        logits: Tensor<B, 3>,
        targets: Tensor<B, 2, Int>,
    ) -> Tensor<B, 2> {
        let [batch_size, seq_length, num_classes] = logits.dims();
        assert_eq!(
            [batch_size, seq_length],
            targets.dims(),
            "Targets must be shaped [batch_size, seq_length] like the logits."
        );
        let num_rows = batch_size * seq_length;

        let loss = self.forward_no_reduction(
            logits.reshape([num_rows, num_classes]),
            targets.reshape([num_rows]),
        );

        loss.reshape([batch_size, seq_length])
    }

    fn smooth<B: Backend>(&self, targets: Tensor<B, 2>, num_classes: usize) -> Tensor<B, 2> {
        if self.smoothing == 0.0 {
            return targets;
        }

        targets
            .mul_scalar(1.0 - self.smoothing)
            .add_scalar(self.smoothing / num_classes as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{Distribution, TensorData};
    use burn::tensor::{Tolerance, ops::FloatElem};
    type FT = FloatElem<TestBackend>;

    fn logits() -> Tensor<TestBackend, 2> {
        Tensor::from_data(
            [[2.0, 1.0, 0.1], [0.1, 2.0, 1.0]],
            &Default::default(),
        )
    }

    #[test]
    fn test_cross_entropy_from_indices() {
        let device = Default::default();
        let targets = Tensor::<TestBackend, 1, Int>::from_data([0, 2], &device);

        let loss = CrossEntropyLossConfig::new().init();
        let per_example = loss.forward_no_reduction(logits(), targets.clone());
        let reduced = loss.forward(logits(), targets, Reduction::Auto);

        let expected = TensorData::from([0.417_030, 1.417_030]);
        per_example
            .into_data()
            .assert_approx_eq::<FT>(&expected, Tolerance::default());
        reduced
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.917_030]), Tolerance::default());
    }

    #[test]
    fn test_cross_entropy_indices_match_one_hot() {
        let device = Default::default();
        let [batch_size, num_classes] = [4, 5];
        let logits = Tensor::<TestBackend, 2>::random(
            [batch_size, num_classes],
            Distribution::Normal(0., 1.0),
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_data([2, 0, 4, 1], &device);
        let targets_probs = Tensor::<TestBackend, 2>::from_data(
            [
                [0.0, 0.0, 1.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0, 1.0],
                [0.0, 1.0, 0.0, 0.0, 0.0],
            ],
            &device,
        );

        let loss = CrossEntropyLossConfig::new().with_smoothing(0.2).init();
        let loss_1 = loss.forward(logits.clone(), targets, Reduction::Sum);
        let loss_2 = loss.forward_probs(logits, targets_probs, Reduction::Sum);

        loss_1
            .into_data()
            .assert_approx_eq::<FT>(&loss_2.into_data(), Tolerance::default());
    }

    #[test]
    fn test_label_smoothing() {
        let device = Default::default();
        let targets = Tensor::<TestBackend, 1, Int>::from_data([0, 2], &device);

        let loss = CrossEntropyLossConfig::new().with_smoothing(0.3).init();
        let per_example = loss.forward_no_reduction(logits(), targets);

        // 0.8 * nll(target) + 0.1 * (nll(other_1) + nll(other_2))
        let expected = TensorData::from([0.707_030, 1.407_030]);
        per_example
            .into_data()
            .assert_approx_eq::<FT>(&expected, Tolerance::default());
    }

    #[test]
    fn test_sequence_cross_entropy_masks_padding() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::from_data(
            [
                [[2.0, 1.0, 0.1], [0.1, 2.0, 1.0]],
                [[0.1, 2.0, 1.0], [5.0, -5.0, 0.0]],
            ],
            &device,
        );
        let targets = Tensor::<TestBackend, 2, Int>::from_data([[0, 2], [1, 1]], &device);
        let lengths = Tensor::<TestBackend, 1, Int>::from_data([2, 1], &device);

        let loss = CrossEntropyLossConfig::new().init();
        let per_position = loss.forward_sequence_no_reduction(logits.clone(), targets.clone());
        let reduced = loss.forward_sequence(logits, targets, Some(lengths), Reduction::Auto);

        let expected = TensorData::from([[0.417_030, 1.417_030], [0.417_030, 10.006_760]]);
        per_position
            .into_data()
            .assert_approx_eq::<FT>(&expected, Tolerance::default());

        // The padded position of the second example does not contribute.
        reduced
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.750_363]), Tolerance::default());
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_cross_entropy_ad_loss() {
        type TestAutodiffTensor = Tensor<crate::TestAutodiffBackend, 2>;

        let device = Default::default();
        let logits = TestAutodiffTensor::from_data([[0.0, 0.0]], &device).require_grad();
        let targets = Tensor::<crate::TestAutodiffBackend, 1, Int>::from_data([1], &device);

        let loss = CrossEntropyLossConfig::new().init();
        let loss = loss.forward(logits.clone(), targets, Reduction::Auto);

        let grads = loss.backward();
        let grads_logits = logits.grad(&grads).unwrap();

        // softmax - onehot
        let expected = TensorData::from([[0.5, -0.5]]);
        grads_logits
            .to_data()
            .assert_approx_eq::<FT>(&expected, Tolerance::default());
    }

    #[test]
    #[should_panic = "Label smoothing must be in [0, 1)"]
    fn smoothing_must_be_below_one() {
        let _ = CrossEntropyLossConfig::new().with_smoothing(1.0).init();
    }

    #[test]
    fn display() {
        let loss = CrossEntropyLossConfig::new().with_smoothing(0.1).init();

        assert_eq!(
            alloc::format!("{loss}"),
            "CrossEntropyLoss {smoothing: 0.1}"
        );
    }
}
