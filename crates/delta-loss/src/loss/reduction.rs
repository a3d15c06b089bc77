use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

/// The reduction type for the loss.
///
/// Losses are weighted element-wise before being reduced: `weighted = weights * losses`.
/// Missing weights count as `1` everywhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum Reduction {
    /// The sum of the weighted losses divided by the sum of the weights.
    Mean,

    /// The sum of the weighted losses will be returned.
    Sum,

    /// The sum of the weighted losses divided by the number of loss elements.
    SumOverBatchSize,

    /// The sum of the weighted losses divided by the number of non-zero weights.
    SumByNonzeroWeights,

    /// Same as [SumByNonzeroWeights](Reduction::SumByNonzeroWeights).
    #[default]
    Auto,
}

impl Reduction {
    /// Reduce element-wise losses to a single value.
    ///
    /// A zero denominator (all weights are zero) yields a loss of `0`.
    ///
    /// # Shapes
    ///
    /// - losses: `[...dims]`
    /// - weights: `[...dims]`
    /// - output: `[1]`
    pub fn reduce<B: Backend, const D: usize>(
        &self,
        losses: Tensor<B, D>,
        weights: Option<Tensor<B, D>>,
    ) -> Tensor<B, 1> {
        let num_elements = losses.shape().num_elements();

        let (weighted, weights) = match weights {
            Some(weights) => {
                assert_eq!(
                    losses.dims(),
                    weights.dims(),
                    "Loss weights must have the same shape as the losses."
                );
                (losses * weights.clone(), Some(weights))
            }
            None => (losses, None),
        };
        let total = weighted.sum();

        match self {
            Reduction::Sum => total,
            Reduction::SumOverBatchSize => total.div_scalar(num_elements as f32),
            Reduction::Mean => match weights {
                Some(weights) => safe_div(total, weights.sum()),
                None => total.div_scalar(num_elements as f32),
            },
            Reduction::SumByNonzeroWeights | Reduction::Auto => match weights {
                Some(weights) => safe_div(total, weights.not_equal_elem(0.0).float().sum()),
                None => total.div_scalar(num_elements as f32),
            },
        }
    }
}

fn safe_div<B: Backend>(numerator: Tensor<B, 1>, denominator: Tensor<B, 1>) -> Tensor<B, 1> {
    let is_zero = denominator.clone().equal_elem(0.0);
    numerator.div(denominator.mask_fill(is_zero, 1.0))
}
