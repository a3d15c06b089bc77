use alloc::vec::Vec;

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::Initializer;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::{assert_lengths_within, log_sum_exp, padding_mask, sequence_mask};

/// Configuration to create a [linear-chain CRF](Crf).
#[derive(Config, Debug)]
pub struct CrfConfig {
    /// Number of tags.
    pub num_tags: usize,
    /// The type of function used to initialize the transition scores.
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    pub initializer: Initializer,
}

impl CrfConfig {
    /// Initialize a new [CRF](Crf) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Crf<B> {
        assert!(self.num_tags > 0, "A CRF needs at least one tag.");
        log::debug!("CRF with {} tags", self.num_tags);

        let transitions = self.initializer.init_with(
            [self.num_tags, self.num_tags],
            Some(self.num_tags),
            Some(self.num_tags),
            device,
        );

        Crf {
            transitions,
            num_tags: self.num_tags,
        }
    }
}

/// Linear-chain conditional random field over tag sequences.
///
/// Scores a tag path as the sum of its emission scores plus the transition scores between
/// consecutive tags. `transitions[i, j]` is the score of moving from tag `i` to tag `j`.
///
/// Should be created with [CrfConfig].
#[derive(Module, Debug)]
pub struct Crf<B: Backend> {
    /// Transition scores of shape `[num_tags, num_tags]`.
    pub transitions: Param<Tensor<B, 2>>,
    /// Number of tags.
    pub num_tags: usize,
}

impl<B: Backend> Crf<B> {
    /// Log-likelihood of the gold tag paths.
    ///
    /// # Shapes
    ///
    /// - emissions: `[batch_size, max_len, num_tags]`
    /// - tags: `[batch_size, max_len]`
    /// - lengths: `[batch_size]`
    /// - output: `[batch_size]`
    pub fn log_likelihood(
        &self,
        emissions: Tensor<B, 3>,
        tags: Tensor<B, 2, Int>,
        lengths: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        crf_log_likelihood(emissions, tags, lengths, self.transitions.val())
    }

    /// Mean negative log-likelihood over the batch, together with the transition scores.
    ///
    /// # Shapes
    ///
    /// - emissions: `[batch_size, max_len, num_tags]`
    /// - tags: `[batch_size, max_len]`
    /// - lengths: `[batch_size]`
    /// - output: (`[1]`, `[num_tags, num_tags]`)
    pub fn loss(
        &self,
        emissions: Tensor<B, 3>,
        tags: Tensor<B, 2, Int>,
        lengths: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let log_likelihood = self.log_likelihood(emissions, tags, lengths);

        (log_likelihood.neg().mean(), self.transitions.val())
    }

    /// Best scoring tag path of every sequence, truncated to its length.
    ///
    /// # Shapes
    ///
    /// - emissions: `[batch_size, max_len, num_tags]`
    /// - lengths: `[batch_size]`
    pub fn decode(&self, emissions: Tensor<B, 3>, lengths: Tensor<B, 1, Int>) -> Vec<Vec<usize>> {
        viterbi_decode(emissions, lengths, self.transitions.val())
    }
}

/// Log-likelihood of tag paths under a linear-chain CRF: path score minus log partition.
///
/// Sequences of length zero have a log-likelihood of zero.
///
/// # Shapes
///
/// - emissions: `[batch_size, max_len, num_tags]`
/// - tags: `[batch_size, max_len]`
/// - lengths: `[batch_size]`
/// - transitions: `[num_tags, num_tags]`
/// - output: `[batch_size]`
pub fn crf_log_likelihood<B: Backend>(
    emissions: Tensor<B, 3>,
    tags: Tensor<B, 2, Int>,
    lengths: Tensor<B, 1, Int>,
    transitions: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let score = crf_sequence_score(
        emissions.clone(),
        tags,
        lengths.clone(),
        transitions.clone(),
    );
    let log_norm = crf_log_norm(emissions, lengths, transitions);

    score - log_norm
}

/// Unnormalized score of the given tag paths.
///
/// # Shapes
///
/// - emissions: `[batch_size, max_len, num_tags]`
/// - tags: `[batch_size, max_len]`
/// - lengths: `[batch_size]`
/// - transitions: `[num_tags, num_tags]`
/// - output: `[batch_size]`
pub fn crf_sequence_score<B: Backend>(
    emissions: Tensor<B, 3>,
    tags: Tensor<B, 2, Int>,
    lengths: Tensor<B, 1, Int>,
    transitions: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let [batch_size, max_len, num_tags] = emissions.dims();
    assert_eq!(
        tags.dims(),
        [batch_size, max_len],
        "Tags must be shaped [batch_size, max_len] like the emissions."
    );
    check_lengths_and_transitions(&lengths, &transitions, [batch_size, max_len, num_tags]);

    // Padded tags may be arbitrary, only valid positions are read.
    let tags = tags.mask_fill(padding_mask(lengths.clone(), max_len), 0);
    let weights = sequence_mask(lengths, max_len).float();

    let unary = emissions
        .gather(2, tags.clone().unsqueeze_dim::<3>(2))
        .reshape([batch_size, max_len]);
    let unary = (unary * weights.clone())
        .sum_dim(1)
        .reshape([batch_size]);

    if max_len < 2 {
        return unary;
    }

    let from = tags.clone().slice([0..batch_size, 0..max_len - 1]);
    let to = tags.slice([0..batch_size, 1..max_len]);
    let pairs = (from.mul_scalar(num_tags as i64) + to).reshape([batch_size * (max_len - 1)]);

    let binary = transitions
        .reshape([num_tags * num_tags])
        .select(0, pairs)
        .reshape([batch_size, max_len - 1]);
    let binary = (binary * weights.slice([0..batch_size, 1..max_len]))
        .sum_dim(1)
        .reshape([batch_size]);

    unary + binary
}

/// Log partition function of the CRF, computed with the forward algorithm.
///
/// # Shapes
///
/// - emissions: `[batch_size, max_len, num_tags]`
/// - lengths: `[batch_size]`
/// - transitions: `[num_tags, num_tags]`
/// - output: `[batch_size]`
pub fn crf_log_norm<B: Backend>(
    emissions: Tensor<B, 3>,
    lengths: Tensor<B, 1, Int>,
    transitions: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let [batch_size, max_len, num_tags] = emissions.dims();
    assert!(max_len > 0, "CRF emissions need at least one time step.");
    check_lengths_and_transitions(&lengths, &transitions, [batch_size, max_len, num_tags]);

    let transitions = transitions
        .unsqueeze_dim::<3>(0)
        .expand([batch_size, num_tags, num_tags]);
    let mut alpha = frame(&emissions, 0);

    for t in 1..max_len {
        let scores = alpha
            .clone()
            .unsqueeze_dim::<3>(2)
            .expand([batch_size, num_tags, num_tags])
            + transitions.clone();
        let next = log_sum_exp(scores, 1).reshape([batch_size, num_tags]) + frame(&emissions, t);

        alpha = alpha.mask_where(active_at(&lengths, t, num_tags), next);
    }

    log_sum_exp(alpha, 1)
        .reshape([batch_size])
        .mask_fill(lengths.equal_elem(0), 0.0)
}

/// Viterbi decoding of the best tag path of every sequence.
///
/// # Shapes
///
/// - emissions: `[batch_size, max_len, num_tags]`
/// - lengths: `[batch_size]`
/// - transitions: `[num_tags, num_tags]`
pub fn viterbi_decode<B: Backend>(
    emissions: Tensor<B, 3>,
    lengths: Tensor<B, 1, Int>,
    transitions: Tensor<B, 2>,
) -> Vec<Vec<usize>> {
    let [batch_size, max_len, num_tags] = emissions.dims();
    assert!(max_len > 0, "CRF emissions need at least one time step.");
    check_lengths_and_transitions(&lengths, &transitions, [batch_size, max_len, num_tags]);

    let transitions = transitions
        .unsqueeze_dim::<3>(0)
        .expand([batch_size, num_tags, num_tags]);
    let mut score = frame(&emissions, 0);
    let mut backpointers = Vec::with_capacity(max_len - 1);

    for t in 1..max_len {
        let scores = score
            .clone()
            .unsqueeze_dim::<3>(2)
            .expand([batch_size, num_tags, num_tags])
            + transitions.clone();
        let (best, best_previous) = scores.max_dim_with_indices(1);
        let next = best.reshape([batch_size, num_tags]) + frame(&emissions, t);

        score = score.mask_where(active_at(&lengths, t, num_tags), next);
        backpointers.push(best_previous.reshape([batch_size, num_tags]));
    }

    let last_tags = to_indices(score.argmax(1).reshape([batch_size]));
    let lengths = to_indices(lengths);
    let backpointers = match backpointers.is_empty() {
        true => Vec::new(),
        false => to_indices(Tensor::stack::<3>(backpointers, 1)),
    };

    let mut paths = Vec::with_capacity(batch_size);
    for (b, (&length, &last_tag)) in lengths.iter().zip(last_tags.iter()).enumerate() {
        if length == 0 {
            paths.push(Vec::new());
            continue;
        }

        let mut path = alloc::vec![0; length];
        path[length - 1] = last_tag;
        for t in (1..length).rev() {
            let offset = (b * (max_len - 1) + (t - 1)) * num_tags;
            path[t - 1] = backpointers[offset + path[t]];
        }
        paths.push(path);
    }

    paths
}

fn frame<B: Backend>(emissions: &Tensor<B, 3>, t: usize) -> Tensor<B, 2> {
    let [batch_size, _, num_tags] = emissions.dims();

    emissions
        .clone()
        .slice([0..batch_size, t..t + 1, 0..num_tags])
        .reshape([batch_size, num_tags])
}

fn active_at<B: Backend>(
    lengths: &Tensor<B, 1, Int>,
    t: usize,
    num_tags: usize,
) -> Tensor<B, 2, burn::tensor::Bool> {
    let [batch_size] = lengths.dims();

    lengths
        .clone()
        .unsqueeze_dim::<2>(1)
        .expand([batch_size, num_tags])
        .greater_elem(t as i64)
}

fn to_indices<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<usize> {
    tensor
        .into_data()
        .iter::<i64>()
        .map(|index| index as usize)
        .collect()
}

fn check_lengths_and_transitions<B: Backend>(
    lengths: &Tensor<B, 1, Int>,
    transitions: &Tensor<B, 2>,
    [batch_size, max_len, num_tags]: [usize; 3],
) {
    assert_eq!(
        lengths.dims(),
        [batch_size],
        "Lengths must hold one entry per sequence."
    );
    assert_eq!(
        transitions.dims(),
        [num_tags, num_tags],
        "Transitions must be shaped [num_tags, num_tags]."
    );
    assert_lengths_within(lengths, max_len, "CRF lengths");
}
