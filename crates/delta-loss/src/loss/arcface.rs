use core::f32::consts::PI;

use burn::config::Config;
use burn::module::{Content, DisplaySettings, Module, ModuleDisplay, Param};
use burn::nn::Initializer;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::{CrossEntropyLoss, Reduction, one_hot_1d};

/// Lower bound of norms and `sin^2` so normalization and `sqrt` stay differentiable.
const NORM_EPSILON: f32 = 1e-12;

/// Configuration to create an [ArcFace](ArcFace) margin layer.
#[derive(Config, Debug)]
pub struct ArcFaceConfig {
    /// Size of the input embeddings.
    pub embedding_dim: usize,
    /// Number of output classes.
    pub num_classes: usize,
    /// Scale `s` applied to the cosine logits.
    #[config(default = 64.0)]
    pub scale: f32,
    /// Additive angular margin `m` in radians.
    #[config(default = 0.5)]
    pub margin: f32,
    /// Keep `theta + m` inside `[0, pi]` by falling back to `s * (cos(theta) - m * sin(m))`
    /// when `theta > pi - m`.
    #[config(default = true)]
    pub limit_to_pi: bool,
    /// The type of function used to initialize the class centers.
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    pub initializer: Initializer,
}

impl ArcFaceConfig {
    /// Initialize a new [ArcFace](ArcFace) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ArcFace<B> {
        self.assertions();
        log::debug!(
            "ArcFace over {} classes with scale {} and margin {}",
            self.num_classes,
            self.scale,
            self.margin
        );

        let weight = self.initializer.init_with(
            [self.embedding_dim, self.num_classes],
            Some(self.embedding_dim),
            Some(self.num_classes),
            device,
        );

        ArcFace {
            weight,
            scale: self.scale,
            margin: self.margin,
            limit_to_pi: self.limit_to_pi,
        }
    }

    fn assertions(&self) {
        assert!(
            self.embedding_dim > 0 && self.num_classes > 0,
            "ArcFace needs a non-empty embedding and at least one class."
        );
        assert!(self.scale > 0.0, "ArcFace scale must be positive.");
        assert!(
            (0.0..PI).contains(&self.margin),
            "ArcFace margin must be in [0, pi), got {}.",
            self.margin
        );
    }
}

/// Additive angular margin (ArcFace) logits.
///
/// Embeddings and class centers are L2 normalized so that their product is `cos(theta)`.
/// The target class logit becomes `s * cos(theta + m)` and the others `s * cos(theta)`.
/// The output is meant to be fed to a softmax cross-entropy, see [ArcFace::loss].
///
/// See also: <https://arxiv.org/abs/1801.07698>
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct ArcFace<B: Backend> {
    /// Class centers of shape `[embedding_dim, num_classes]`.
    pub weight: Param<Tensor<B, 2>>,
    /// Logit scale.
    pub scale: f32,
    /// Angular margin.
    pub margin: f32,
    /// Fall back to a linear penalty once `theta + m` would leave `[0, pi]`.
    pub limit_to_pi: bool,
}

impl<B: Backend> ModuleDisplay for ArcFace<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        let [embedding_dim, num_classes] = self.weight.shape().dims();

        content
            .add("embedding_dim", &embedding_dim)
            .add("num_classes", &num_classes)
            .add("scale", &self.scale)
            .add("margin", &self.margin)
            .optional()
    }
}

impl<B: Backend> ArcFace<B> {
    /// Margin logits of the embeddings.
    ///
    /// # Shapes
    ///
    /// - embedding: `[batch_size, embedding_dim]`
    /// - labels: `[batch_size]`
    /// - output: `[batch_size, num_classes]`
    pub fn forward(&self, embedding: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        arcface_logits(
            embedding,
            labels,
            self.weight.val(),
            self.scale,
            self.margin,
            self.limit_to_pi,
        )
    }

    /// Softmax cross-entropy of the margin logits, averaged over the batch.
    ///
    /// # Shapes
    ///
    /// - embedding: `[batch_size, embedding_dim]`
    /// - labels: `[batch_size]`
    /// - output: `[1]`
    pub fn loss(&self, embedding: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let logits = self.forward(embedding, labels.clone());
        CrossEntropyLoss { smoothing: 0.0 }.forward(logits, labels, Reduction::Auto)
    }
}

/// ArcFace logits with explicit class centers.
///
/// # Shapes
///
/// - embedding: `[batch_size, embedding_dim]`
/// - labels: `[batch_size]`
/// - weight: `[embedding_dim, num_classes]`
/// - output: `[batch_size, num_classes]`
pub fn arcface_logits<B: Backend>(
    embedding: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    weight: Tensor<B, 2>,
    scale: f32,
    margin: f32,
    limit_to_pi: bool,
) -> Tensor<B, 2> {
    let [batch_size, embedding_dim] = embedding.dims();
    let [weight_dim, num_classes] = weight.dims();
    assert_eq!(
        embedding_dim, weight_dim,
        "Embedding size does not match the class centers."
    );
    assert_eq!(
        labels.dims(),
        [batch_size],
        "ArcFace needs one label per embedding."
    );

    let (cos_m, sin_m) = (margin.cos(), margin.sin());
    let threshold = (PI - margin).cos();

    let embedding = l2_normalize(embedding, 1);
    let weight = l2_normalize(weight, 0);

    // cos(theta + m) = cos(theta) cos(m) - sin(theta) sin(m)
    let cos_t = embedding.matmul(weight);
    let sin_t = cos_t
        .clone()
        .mul(cos_t.clone())
        .neg()
        .add_scalar(1.0)
        .clamp_min(NORM_EPSILON)
        .sqrt();
    let cos_mt = (cos_t.clone().mul_scalar(cos_m) - sin_t.mul_scalar(sin_m)).mul_scalar(scale);

    let cos_mt = match limit_to_pi {
        true => {
            let in_range = cos_t.clone().greater_elem(threshold);
            let linear = cos_t.clone().sub_scalar(sin_m * margin).mul_scalar(scale);
            linear.mask_where(in_range, cos_mt)
        }
        false => cos_mt,
    };

    let target = one_hot_1d(labels, num_classes);
    let others = target.clone().neg().add_scalar(1.0);

    cos_t.mul_scalar(scale) * others + cos_mt * target
}

fn l2_normalize<B: Backend>(tensor: Tensor<B, 2>, dim: usize) -> Tensor<B, 2> {
    let dims = tensor.dims();
    let norm = tensor
        .clone()
        .mul(tensor.clone())
        .sum_dim(dim)
        .sqrt()
        .clamp_min(NORM_EPSILON);

    tensor / norm.expand(dims)
}
