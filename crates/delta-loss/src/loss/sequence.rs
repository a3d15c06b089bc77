use burn::config::Config;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::{CrossEntropyLoss, len_to_weights};

/// Added to the weight mass so that an all-padding batch reduces to zero.
const WEIGHT_EPSILON: f32 = 1e-12;

/// Configuration to create a [masked sequence loss](SequenceLoss).
#[derive(Config, Debug)]
pub struct SequenceLossConfig {
    /// Average over the valid positions of the whole batch. When `false`, every sequence is
    /// averaged over its own valid positions and one loss per sequence is returned.
    #[config(default = true)]
    pub average_across_batch: bool,
}

impl SequenceLossConfig {
    /// Initialize [masked sequence loss](SequenceLoss).
    pub fn init(&self) -> SequenceLoss {
        SequenceLoss {
            average_across_batch: self.average_across_batch,
        }
    }
}

/// Softmax cross-entropy of a sequence-to-sequence decoder, averaged over valid positions.
///
/// `loss = sum(ce * w) / (sum(w) + 1e-12)` where `w[b, t] = t < label_lengths[b]`. The sums
/// run over the whole batch, or over each sequence when `average_across_batch` is off.
#[derive(Module, Debug, Clone)]
pub struct SequenceLoss {
    /// Average over the whole batch instead of per sequence.
    pub average_across_batch: bool,
}

impl SequenceLoss {
    /// Compute the criterion.
    ///
    /// Without `label_lengths` every position counts.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, max_len, vocab_size]`
    /// - labels: `[batch_size, max_len]`
    /// - label_lengths: `[batch_size]`
    /// - output: `[1]`, or `[batch_size]` when not averaging across the batch
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        label_lengths: Option<Tensor<B, 1, Int>>,
    ) -> Tensor<B, 1> {
        let [batch_size, max_len, _] = logits.dims();
        let crossent =
            CrossEntropyLoss { smoothing: 0.0 }.forward_sequence_no_reduction(logits, labels);

        let weights = match label_lengths {
            Some(lengths) => len_to_weights(lengths, max_len),
            None => Tensor::ones([batch_size, max_len], &crossent.device()),
        };
        let weighted = crossent * weights.clone();

        if self.average_across_batch {
            return weighted
                .sum()
                .div(weights.sum().add_scalar(WEIGHT_EPSILON));
        }

        let totals = weighted.sum_dim(1).reshape([batch_size]);
        let masses = weights.sum_dim(1).reshape([batch_size]);
        totals.div(masses.add_scalar(WEIGHT_EPSILON))
    }
}
