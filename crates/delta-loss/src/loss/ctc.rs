use alloc::vec;

use burn::config::Config;
use burn::module::Module;
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, ElementConversion, Int, Tensor};

use super::{
    LOG_ZERO, Reduction, assert_lengths_within, log_sum_exp, padding_mask, sequence_mask,
};

/// Configuration to create a [CTC loss](CtcLoss).
#[derive(Config, Debug)]
pub struct CtcLossConfig {
    /// Index of the blank symbol in the class dimension.
    #[config(default = 0)]
    pub blank_index: usize,
}

impl CtcLossConfig {
    /// Initialize [CTC loss](CtcLoss).
    pub fn init(&self) -> CtcLoss {
        log::debug!("CTC loss with blank index {}", self.blank_index);

        CtcLoss {
            blank_index: self.blank_index,
        }
    }
}

/// Connectionist Temporal Classification loss.
///
/// Computes `-log p(labels | logits)` summed over every alignment of the label sequence to
/// the input frames, where alignments may repeat labels and insert blanks. The forward
/// variables are propagated in log space with batched tensor operations, so the loss is
/// differentiable through any autodiff backend.
///
/// Labels are dense and padded: only the first `label_lengths[b]` labels of each row are
/// read, and only the first `input_lengths[b]` frames of each example are consumed.
///
/// An example whose input is too short to emit its labels has no valid alignment; its loss
/// is a very large finite number (about `1e30`).
///
/// See also: <https://www.cs.toronto.edu/~graves/icml_2006.pdf>
#[derive(Module, Debug, Clone)]
pub struct CtcLoss {
    /// Index of the blank symbol.
    pub blank_index: usize,
}

/// Extended label sequences `blank, l_1, blank, l_2, ..., l_L, blank` of a batch.
#[derive(new)]
struct CtcLattice<B: Backend> {
    /// `[batch_size, 2 * max_label_len + 1]`
    labels: Tensor<B, 2, Int>,
    /// `true` where the transition from `s - 2` to `s` is forbidden.
    no_skip: Tensor<B, 2, Bool>,
}

impl CtcLoss {
    /// Compute the per-example CTC loss.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, max_time, num_classes]` (unnormalized, batch major)
    /// - labels: `[batch_size, max_label_len]`
    /// - input_lengths: `[batch_size]`
    /// - label_lengths: `[batch_size]`
    /// - output: `[batch_size]`
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        input_lengths: Tensor<B, 1, Int>,
        label_lengths: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [batch_size, max_time, num_classes] = logits.dims();
        self.assertions(
            [batch_size, max_time, num_classes],
            labels.dims(),
            input_lengths.dims(),
            label_lengths.dims(),
        );
        let [_, max_label_len] = labels.dims();
        assert_lengths_within(&input_lengths, max_time, "CTC input lengths");
        assert_lengths_within(&label_lengths, max_label_len, "CTC label lengths");
        if log::log_enabled!(log::Level::Warn) {
            self.warn_infeasible(labels.clone(), input_lengths.clone(), label_lengths.clone());
        }

        let lattice = self.lattice(labels, label_lengths.clone());
        let [_, num_states] = lattice.labels.dims();

        let log_probs = log_softmax(logits, 2);
        let emissions = log_probs.gather(
            2,
            lattice
                .labels
                .clone()
                .unsqueeze_dim::<3>(1)
                .expand([batch_size, max_time, num_states]),
        );

        let device = emissions.device();
        let states = Tensor::<B, 1, Int>::arange(0..num_states as i64, &device)
            .unsqueeze_dim::<2>(0)
            .expand([batch_size, num_states]);

        // Only the leading blank and the first label may start a path, and only when the
        // example has a first frame.
        let no_frames = input_lengths.clone().equal_elem(0);
        let mut alpha = step(&emissions, 0, batch_size, num_states)
            .mask_fill(states.greater_equal_elem(2), LOG_ZERO)
            .mask_fill(
                no_frames
                    .clone()
                    .unsqueeze_dim::<2>(1)
                    .expand([batch_size, num_states]),
                LOG_ZERO,
            );

        for t in 1..max_time {
            let previous = alpha.clone();
            let stay = previous.clone();
            let advance = shift_states(previous.clone(), 1);
            let skip =
                shift_states(previous.clone(), 2).mask_fill(lattice.no_skip.clone(), LOG_ZERO);

            let paths = Tensor::stack::<3>(vec![stay, advance, skip], 2);
            let next = log_sum_exp(paths, 2).reshape([batch_size, num_states])
                + step(&emissions, t, batch_size, num_states);

            let active = input_lengths
                .clone()
                .unsqueeze_dim::<2>(1)
                .expand([batch_size, num_states])
                .greater_elem(t as i64);
            alpha = previous.mask_where(active, next);
        }

        // A path ends on the last label or on the trailing blank.
        let last = label_lengths.clone().mul_scalar(2).reshape([batch_size, 1]);
        let empty = label_lengths.equal_elem(0);
        let before_last = (last.clone() - 1).clamp_min(0);

        let end_blank = alpha.clone().gather(1, last);
        let end_label = alpha
            .gather(1, before_last)
            .mask_fill(empty.clone().reshape([batch_size, 1]), LOG_ZERO);

        let loss = log_sum_exp(Tensor::cat(vec![end_blank, end_label], 1), 1)
            .reshape([batch_size])
            .neg();

        // Without frames the empty label sequence is certain.
        let certain = no_frames.int().add(empty.int()).equal_elem(2);
        loss.mask_fill(certain, 0.0)
    }

    /// Compute the CTC loss and reduce it over the batch.
    ///
    /// Every example has a weight of one, so all weighted reductions except
    /// [Sum](Reduction::Sum) average over the batch.
    ///
    /// # Shapes
    ///
    /// - output: `[1]`
    pub fn forward_with_reduction<B: Backend>(
        &self,
        logits: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        input_lengths: Tensor<B, 1, Int>,
        label_lengths: Tensor<B, 1, Int>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let loss = self.forward(logits, labels, input_lengths, label_lengths);
        reduction.reduce(loss, None)
    }

    fn lattice<B: Backend>(
        &self,
        labels: Tensor<B, 2, Int>,
        label_lengths: Tensor<B, 1, Int>,
    ) -> CtcLattice<B> {
        let [batch_size, max_label_len] = labels.dims();
        let device = labels.device();
        let blank = self.blank_index as i64;

        // Padding may hold arbitrary ids, replace it so the gather stays in range.
        let labels = labels.mask_fill(padding_mask(label_lengths, max_label_len), blank);

        let blanks = Tensor::<B, 2, Int>::full([batch_size, max_label_len], blank, &device);
        let interleaved = Tensor::stack::<3>(vec![blanks, labels], 2)
            .reshape([batch_size, 2 * max_label_len]);
        let trailing = Tensor::<B, 2, Int>::full([batch_size, 1], blank, &device);
        let extended = Tensor::cat(vec![interleaved, trailing], 1);

        let num_states = 2 * max_label_len + 1;
        let two_back = if num_states > 2 {
            Tensor::cat(
                vec![
                    Tensor::<B, 2, Int>::full([batch_size, 2], blank, &device),
                    extended.clone().slice([0..batch_size, 0..num_states - 2]),
                ],
                1,
            )
        } else {
            Tensor::<B, 2, Int>::full([batch_size, num_states], blank, &device)
        };

        // Skipping is forbidden onto blanks and between repeated labels.
        let onto_blank = extended.clone().equal_elem(blank).int();
        let repeated = extended.clone().equal(two_back).int();
        let no_skip = (onto_blank + repeated).greater_elem(0);

        CtcLattice::new(extended, no_skip)
    }

    fn assertions(
        &self,
        [batch_size, max_time, num_classes]: [usize; 3],
        [label_batch, _]: [usize; 2],
        [input_batch]: [usize; 1],
        [length_batch]: [usize; 1],
    ) {
        assert!(max_time > 0, "CTC needs at least one input frame.");
        assert!(
            self.blank_index < num_classes,
            "Blank index {} is out of range for {num_classes} classes.",
            self.blank_index
        );
        assert!(
            label_batch == batch_size && input_batch == batch_size && length_batch == batch_size,
            "Logits, labels and lengths must have the same batch size."
        );
    }

    fn warn_infeasible<B: Backend>(
        &self,
        labels: Tensor<B, 2, Int>,
        input_lengths: Tensor<B, 1, Int>,
        label_lengths: Tensor<B, 1, Int>,
    ) {
        let too_short: i64 = input_lengths
            .lower(min_input_lengths(labels, label_lengths))
            .int()
            .sum()
            .into_scalar()
            .elem();
        if too_short > 0 {
            log::warn!(
                "{too_short} CTC inputs are too short for their labels, no alignment exists."
            );
        }
    }
}

/// Fewest frames that can emit each label sequence: one per label plus a blank between
/// every pair of equal neighbours.
///
/// # Shapes
///
/// - labels: `[batch_size, max_label_len]`
/// - label_lengths: `[batch_size]`
/// - output: `[batch_size]`
pub fn min_input_lengths<B: Backend>(
    labels: Tensor<B, 2, Int>,
    label_lengths: Tensor<B, 1, Int>,
) -> Tensor<B, 1, Int> {
    let [batch_size, max_label_len] = labels.dims();
    if max_label_len < 2 {
        return label_lengths;
    }

    let previous = labels.clone().slice([0..batch_size, 0..max_label_len - 1]);
    let current = labels.slice([0..batch_size, 1..max_label_len]);
    // Pair (t - 1, t) counts when t is inside the label sequence.
    let inside = sequence_mask(label_lengths.clone(), max_label_len)
        .slice([0..batch_size, 1..max_label_len])
        .int();
    let repeats = current.equal(previous).int().mul(inside).sum_dim(1);

    label_lengths + repeats.reshape([batch_size])
}

fn step<B: Backend>(
    emissions: &Tensor<B, 3>,
    t: usize,
    batch_size: usize,
    num_states: usize,
) -> Tensor<B, 2> {
    emissions
        .clone()
        .slice([0..batch_size, t..t + 1, 0..num_states])
        .reshape([batch_size, num_states])
}

/// Move every state `offset` positions to the right, filling the vacated states with `LOG_ZERO`.
fn shift_states<B: Backend>(alpha: Tensor<B, 2>, offset: usize) -> Tensor<B, 2> {
    let [batch_size, num_states] = alpha.dims();
    let device = alpha.device();

    if offset >= num_states {
        return Tensor::full([batch_size, num_states], LOG_ZERO, &device);
    }

    Tensor::cat(
        vec![
            Tensor::full([batch_size, offset], LOG_ZERO, &device),
            alpha.slice([0..batch_size, 0..num_states - offset]),
        ],
        1,
    )
}
