use std::error::Error;
use std::path::PathBuf;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Distribution, ElementConversion, Int, Tensor};
use clap::Parser;
use delta_loss::LossError;
use delta_loss::config::LossConfig;
use delta_loss::loss::{ArcFaceConfig, CrfConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Evaluate a configured loss on random inputs and report its value and gradient")]
pub struct Args {
    /// JSON loss configuration. Takes precedence over `--loss`.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Loss type name, e.g. `CTCLoss` or `CrfLoss`.
    #[arg(long, default_value = "CTCLoss")]
    pub loss: String,

    /// Number of examples in the batch.
    #[arg(long, default_value = "4")]
    pub batch_size: usize,

    /// Padded time dimension of the inputs.
    #[arg(long, default_value = "12")]
    pub max_len: usize,

    /// Number of classes, tags or vocabulary entries.
    #[arg(long, default_value = "6")]
    pub num_classes: usize,

    /// Embedding size for ArcFace.
    #[arg(long, default_value = "16")]
    pub embedding_dim: usize,

    /// Write the effective configuration to this file.
    #[arg(long)]
    pub dump_config: Option<PathBuf>,
}

#[cfg(feature = "ndarray")]
type Backend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
type Backend = burn::backend::Autodiff<burn::backend::Wgpu>;

fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()?;

    let config = load_config(&args)?;
    if let Some(path) = &args.dump_config {
        config.save(path)?;
        tracing::info!(path = %path.display(), "Wrote loss configuration");
    }

    let device = Default::default();
    let report = run::<Backend>(&config, &args, &device);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_config(args: &Args) -> Result<LossConfig, LossError> {
    // Sizes given on the command line apply to losses selected by name.
    let config = match &args.config {
        Some(path) => LossConfig::load(path)?,
        None => match LossConfig::from_name(&args.loss)? {
            LossConfig::Crf(_) => LossConfig::Crf(CrfConfig::new(args.num_classes)),
            LossConfig::ArcFace(_) => LossConfig::ArcFace(ArcFaceConfig::new(
                args.embedding_dim,
                args.num_classes,
            )),
            config => config,
        },
    };

    tracing::info!(loss = config.name(), "Loaded loss configuration");
    Ok(config)
}

#[tracing::instrument(skip_all, fields(loss = config.name()))]
fn run<B: AutodiffBackend>(
    config: &LossConfig,
    args: &Args,
    device: &B::Device,
) -> serde_json::Value {
    let [batch_size, max_len] = [args.batch_size, args.max_len];

    let lengths = random_lengths::<B>(batch_size, max_len, device);
    let logits = Tensor::<B, 3>::random(
        [batch_size, max_len, class_count(config, args)],
        Distribution::Normal(0.0, 1.0),
        device,
    )
    .require_grad();

    let (loss, extra) = match config {
        LossConfig::CrossEntropy(config) => {
            let targets = random_labels::<B>(batch_size, max_len, 0, args.num_classes, device);
            let loss = config.loss.init().forward_sequence(
                logits.clone(),
                targets,
                Some(lengths),
                config.reduction,
            );
            (loss, serde_json::Value::Null)
        }
        LossConfig::Ctc(config) => {
            let ctc = config.init();
            // Labels avoid the blank and are at most half as long as the inputs.
            let label_len = (max_len / 2).max(1);
            let non_blank = args.num_classes.saturating_sub(1).max(1);
            let labels = random_labels::<B>(batch_size, label_len, 0, non_blank, device);
            let labels = labels.clone() + labels.greater_equal_elem(ctc.blank_index as i64).int();
            let label_lengths = lengths.clone().div_scalar(2).clamp_max(label_len as i64);

            let per_example = ctc.forward(logits.clone(), labels, lengths, label_lengths);
            let extra = serde_json::json!({ "per_example": to_vec(per_example.clone()) });
            (per_example.mean(), extra)
        }
        LossConfig::Crf(config) => {
            let crf = config.init::<B>(device);
            let tags = random_labels::<B>(batch_size, max_len, 0, config.num_tags, device);

            let (loss, _) = crf.loss(logits.clone(), tags, lengths.clone());
            let paths = crf.decode(logits.clone().detach(), lengths);
            (loss, serde_json::json!({ "viterbi_paths": paths }))
        }
        LossConfig::SequenceCrossEntropy(config) => {
            let labels = random_labels::<B>(batch_size, max_len, 0, args.num_classes, device);
            let loss = config.init().forward(logits.clone(), labels, Some(lengths));
            (loss, serde_json::Value::Null)
        }
        LossConfig::ArcFace(config) => {
            let arcface = config.init::<B>(device);
            let embedding = logits
                .clone()
                .slice([0..batch_size, 0..1, 0..config.embedding_dim])
                .reshape([batch_size, config.embedding_dim]);
            let labels = random_labels::<B>(batch_size, 1, 0, config.num_classes, device)
                .reshape([batch_size]);
            (arcface.loss(embedding, labels), serde_json::Value::Null)
        }
    };

    let value = loss.clone().into_scalar().elem::<f64>();
    let grads = loss.backward();
    let grad_norm = logits
        .grad(&grads)
        .map(|grad| grad.powf_scalar(2.0).sum().sqrt().into_scalar().elem::<f64>());

    tracing::info!(value, ?grad_norm, "Evaluated loss");
    serde_json::json!({
        "loss": config.name(),
        "value": value,
        "grad_norm": grad_norm,
        "details": extra,
    })
}

/// Size of the last input dimension each loss expects.
fn class_count(config: &LossConfig, args: &Args) -> usize {
    match config {
        LossConfig::Crf(config) => config.num_tags,
        LossConfig::ArcFace(config) => config.embedding_dim,
        _ => args.num_classes,
    }
}

fn random_lengths<B: AutodiffBackend>(
    batch_size: usize,
    max_len: usize,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    random_labels::<B>(batch_size, 1, 1, max_len + 1, device).reshape([batch_size])
}

fn random_labels<B: AutodiffBackend>(
    batch_size: usize,
    len: usize,
    low: usize,
    high: usize,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    Tensor::<B, 2>::random(
        [batch_size, len],
        Distribution::Uniform(low as f64, high as f64),
        device,
    )
    .floor()
    .int()
    .clamp(low as i64, high.saturating_sub(1) as i64)
}

fn to_vec<B: burn::tensor::backend::Backend>(tensor: Tensor<B, 1>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}
