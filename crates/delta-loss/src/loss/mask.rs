use burn::tensor::backend::Backend;
use burn::tensor::{Bool, ElementConversion, Int, Tensor};

/// Value standing in for `log(0)` in the log-space recursions.
///
/// Finite so that `log_sum_exp` over unreachable states stays NaN-free.
pub const LOG_ZERO: f32 = -1.0e30;

/// Build a boolean mask that is `true` for every valid position of a padded batch.
///
/// `mask[b, t] = t < lengths[b]`. The mask is `max_len` wide, which should be the time
/// dimension of the tensor the mask is applied to.
///
/// # Shapes
///
/// - lengths: `[batch_size]`
/// - output: `[batch_size, max_len]`
pub fn sequence_mask<B: Backend>(lengths: Tensor<B, 1, Int>, max_len: usize) -> Tensor<B, 2, Bool> {
    let (positions, lengths) = positions_and_lengths(lengths, max_len);
    positions.lower(lengths)
}

/// Inverse of [sequence_mask]: `true` on padding positions.
///
/// # Shapes
///
/// - lengths: `[batch_size]`
/// - output: `[batch_size, max_len]`
pub fn padding_mask<B: Backend>(lengths: Tensor<B, 1, Int>, max_len: usize) -> Tensor<B, 2, Bool> {
    let (positions, lengths) = positions_and_lengths(lengths, max_len);
    positions.greater_equal(lengths)
}

/// Float 0/1 weights of the valid positions, used to weight per-position losses.
///
/// # Shapes
///
/// - lengths: `[batch_size]`
/// - output: `[batch_size, max_len]`
pub fn len_to_weights<B: Backend>(lengths: Tensor<B, 1, Int>, max_len: usize) -> Tensor<B, 2> {
    sequence_mask(lengths, max_len).float()
}

/// Accept lengths stored as a `[batch_size, 1]` column and return them as `[batch_size]`.
pub fn flatten_lengths<B: Backend>(lengths: Tensor<B, 2, Int>) -> Tensor<B, 1, Int> {
    let [batch_size, width] = lengths.dims();
    assert_eq!(
        width, 1,
        "Lengths must be shaped [batch_size] or [batch_size, 1], got [{batch_size}, {width}]."
    );

    lengths.reshape([batch_size])
}

/// Panic when a length is negative or exceeds the padded width it indexes into.
///
/// Reads the lengths back from the device.
pub fn assert_lengths_within<B: Backend>(lengths: &Tensor<B, 1, Int>, max_len: usize, name: &str) {
    let out_of_range: i64 = lengths
        .clone()
        .greater_elem(max_len as i64)
        .int()
        .add(lengths.clone().lower_elem(0).int())
        .sum()
        .into_scalar()
        .elem();

    assert!(
        out_of_range == 0,
        "{name} must be in [0, {max_len}], {out_of_range} of them are not."
    );
}

/// One-hot encode class indices.
///
/// # Shapes
///
/// - labels: `[batch_size]`
/// - output: `[batch_size, num_classes]`
pub fn one_hot_1d<B: Backend>(labels: Tensor<B, 1, Int>, num_classes: usize) -> Tensor<B, 2> {
    let [batch_size] = labels.dims();
    let classes = Tensor::<B, 1, Int>::arange(0..num_classes as i64, &labels.device())
        .unsqueeze_dim::<2>(0)
        .expand([batch_size, num_classes]);

    labels
        .unsqueeze_dim::<2>(1)
        .expand([batch_size, num_classes])
        .equal(classes)
        .float()
}

/// One-hot encode a batch of label sequences.
///
/// # Shapes
///
/// - labels: `[batch_size, seq_length]`
/// - output: `[batch_size, seq_length, num_classes]`
pub fn one_hot_2d<B: Backend>(labels: Tensor<B, 2, Int>, num_classes: usize) -> Tensor<B, 3> {
    let [batch_size, seq_length] = labels.dims();
    let encoded = one_hot_1d(labels.reshape([batch_size * seq_length]), num_classes);

    encoded.reshape([batch_size, seq_length, num_classes])
}

/// Numerically stable `log(sum(exp(x)))` along `dim`. The reduced dimension is kept with size 1.
pub fn log_sum_exp<B: Backend, const D: usize>(tensor: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let dims = tensor.dims();
    let max = tensor.clone().max_dim(dim).detach();

    let shifted = tensor - max.clone().expand(dims);
    shifted.exp().sum_dim(dim).log() + max
}

fn positions_and_lengths<B: Backend>(
    lengths: Tensor<B, 1, Int>,
    max_len: usize,
) -> (Tensor<B, 2, Int>, Tensor<B, 2, Int>) {
    let [batch_size] = lengths.dims();
    let positions = Tensor::<B, 1, Int>::arange(0..max_len as i64, &lengths.device())
        .unsqueeze_dim::<2>(0)
        .expand([batch_size, max_len]);
    let lengths = lengths
        .unsqueeze_dim::<2>(1)
        .expand([batch_size, max_len]);

    (positions, lengths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::TensorData;
    use burn::tensor::{Tolerance, ops::FloatElem};
    type FT = FloatElem<TestBackend>;

    #[test]
    fn sequence_mask_marks_valid_positions() {
        let device = Default::default();
        let lengths = Tensor::<TestBackend, 1, Int>::from_data([2, 0, 3], &device);

        let mask = sequence_mask(lengths.clone(), 3);
        let padding = padding_mask(lengths, 3);

        mask.into_data().assert_eq(
            &TensorData::from([
                [true, true, false],
                [false, false, false],
                [true, true, true],
            ]),
            false,
        );
        padding.into_data().assert_eq(
            &TensorData::from([
                [false, false, true],
                [true, true, true],
                [false, false, false],
            ]),
            false,
        );
    }

    #[test]
    fn sequence_mask_uses_requested_width() {
        let device = Default::default();
        let lengths = Tensor::<TestBackend, 1, Int>::from_data([1, 2], &device);

        let weights = len_to_weights(lengths, 4);

        weights.into_data().assert_eq(
            &TensorData::from([[1.0f32, 0.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0]]),
            false,
        );
    }

    #[test]
    fn flatten_lengths_accepts_column() {
        let device = Default::default();
        let lengths = Tensor::<TestBackend, 2, Int>::from_data([[4], [2], [7]], &device);

        let lengths = flatten_lengths(lengths);

        assert_eq!(lengths.dims(), [3]);
    }

    #[test]
    #[should_panic = "Lengths must be shaped"]
    fn flatten_lengths_rejects_matrix() {
        let device = Default::default();
        let lengths = Tensor::<TestBackend, 2, Int>::from_data([[4, 1], [2, 1]], &device);

        let _ = flatten_lengths(lengths);
    }

    #[test]
    fn lengths_within_width_are_accepted() {
        let device = Default::default();
        let lengths = Tensor::<TestBackend, 1, Int>::from_data([0, 3, 2], &device);

        assert_lengths_within(&lengths, 3, "Lengths");
    }

    #[test]
    #[should_panic = "Input lengths must be in [0, 3], 1 of them are not."]
    fn lengths_past_width_are_rejected() {
        let device = Default::default();
        let lengths = Tensor::<TestBackend, 1, Int>::from_data([4, 3], &device);

        assert_lengths_within(&lengths, 3, "Input lengths");
    }

    #[test]
    fn one_hot_encodes_sequences() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2, Int>::from_data([[0, 2], [1, 1]], &device);

        let encoded = one_hot_2d(labels, 3);

        encoded.into_data().assert_eq(
            &TensorData::from([
                [[1.0f32, 0.0, 0.0], [0.0, 0.0, 1.0]],
                [[0.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            ]),
            false,
        );
    }

    #[test]
    fn log_sum_exp_is_stable_for_large_and_unreachable_values() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 2>::from_data(
            [[1000.0, 1000.0], [LOG_ZERO, 0.0]],
            &device,
        );

        let output = log_sum_exp(tensor, 1);

        output.into_data().assert_approx_eq::<FT>(
            &TensorData::from([[1000.693_147f32], [0.0]]),
            Tolerance::default(),
        );
    }
}
