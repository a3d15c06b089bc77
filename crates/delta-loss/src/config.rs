use alloc::string::{String, ToString};

use burn::config::{Config, ConfigError};
use serde_json::Value;

use crate::LossError;
use crate::loss::{
    ArcFaceConfig, CrfConfig, CrossEntropyLossConfig, CtcLossConfig, Reduction, SequenceLossConfig,
};

/// Serialized selection of a training loss.
///
/// The JSON form is tagged by `"type"`, e.g.
///
/// ```json
/// { "type": "Ctc", "blank_index": 0 }
/// ```
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum LossConfig {
    /// Softmax cross-entropy, for classification and sequence classification.
    CrossEntropy(CrossEntropyConfig),
    /// Connectionist temporal classification.
    Ctc(CtcLossConfig),
    /// Linear-chain CRF negative log-likelihood.
    Crf(CrfConfig),
    /// Masked sequence-to-sequence cross-entropy.
    SequenceCrossEntropy(SequenceLossConfig),
    /// ArcFace margin logits followed by a softmax cross-entropy.
    ArcFace(ArcFaceConfig),
}

/// Cross-entropy settings together with the reduction applied to the weighted losses.
#[derive(Config, Debug)]
pub struct CrossEntropyConfig {
    /// The loss itself.
    #[config(default = "CrossEntropyLossConfig::new()")]
    pub loss: CrossEntropyLossConfig,
    /// How the per-example losses are reduced.
    #[config(default = "Reduction::Auto")]
    pub reduction: Reduction,
}

/// Default number of tags / classes when a loss is selected by name only.
const DEFAULT_NUM_CLASSES: usize = 2;
/// Default embedding size when ArcFace is selected by name only.
const DEFAULT_EMBEDDING_DIM: usize = 128;

impl LossConfig {
    /// Default configuration of a loss given by its type name.
    ///
    /// Both the class names used in toolkit configuration files (`"CTCLoss"`, `"CrfLoss"`,
    /// ...) and the variant names of this enum are accepted.
    pub fn from_name(name: &str) -> Result<Self, LossError> {
        let config = match name {
            "CrossEntropyLoss" | "CrossEntropy" => {
                Self::CrossEntropy(CrossEntropyConfig::new())
            }
            "CTCLoss" | "CtcLoss" | "Ctc" => Self::Ctc(CtcLossConfig::new()),
            "CrfLoss" | "Crf" => Self::Crf(CrfConfig::new(DEFAULT_NUM_CLASSES)),
            "SequenceCrossEntropyLoss" | "SequenceCrossEntropy" => {
                Self::SequenceCrossEntropy(SequenceLossConfig::new())
            }
            "ArcFaceLoss" | "ArcFace" => Self::ArcFace(ArcFaceConfig::new(
                DEFAULT_EMBEDDING_DIM,
                DEFAULT_NUM_CLASSES,
            )),
            _ => return Err(LossError::UnknownLoss(name.to_string())),
        };

        log::debug!("Selected loss `{name}`: {config:?}");
        Ok(config)
    }

    /// Name of the selected loss.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CrossEntropy(_) => "CrossEntropy",
            Self::Ctc(_) => "Ctc",
            Self::Crf(_) => "Crf",
            Self::SequenceCrossEntropy(_) => "SequenceCrossEntropy",
            Self::ArcFace(_) => "ArcFace",
        }
    }

    /// Parse a configuration from its JSON form.
    ///
    /// Fields that have a default may be left out, only the required ones (`num_tags` for
    /// the CRF, `embedding_dim` and `num_classes` for ArcFace) must be present.
    pub fn from_json(content: &str) -> Result<Self, LossError> {
        let value: Value = serde_json::from_str(content).map_err(invalid_format)?;

        serde_json::from_value(Self::with_defaults(value)?).map_err(invalid_format)
    }

    /// Serialize the configuration to pretty JSON.
    pub fn to_json(&self) -> Result<String, LossError> {
        serde_json::to_string_pretty(self).map_err(invalid_format)
    }

    /// Fields without a default value.
    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Crf(_) => &["num_tags"],
            Self::ArcFace(_) => &["embedding_dim", "num_classes"],
            _ => &[],
        }
    }

    /// Lay a parsed configuration over the defaults of its `type`.
    ///
    /// Unknown types are returned untouched and rejected when deserializing. The `type` may
    /// be any name accepted by [from_name](LossConfig::from_name).
    fn with_defaults(value: Value) -> Result<Value, LossError> {
        let Some(defaults) = value
            .get("type")
            .and_then(Value::as_str)
            .and_then(|name| Self::from_name(name).ok())
        else {
            return Ok(value);
        };

        let mut merged = serde_json::to_value(&defaults).map_err(invalid_format)?;
        if let (Value::Object(fields), Value::Object(overlay)) = (&mut merged, value) {
            for field in defaults.required_fields() {
                fields.remove(*field);
            }
            for (key, value) in overlay {
                match fields.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        fields.insert(key, value);
                    }
                }
            }
            // Toolkit names such as `CTCLoss` resolve to the variant name.
            fields.insert("type".to_string(), Value::from(defaults.name()));
        }

        Ok(merged)
    }

    /// Load a configuration file.
    #[cfg(feature = "std")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> Result<Self, LossError> {
        let content = std::fs::read_to_string(file)?;
        Self::from_json(&content)
    }

    /// Save the configuration to a file.
    #[cfg(feature = "std")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> Result<(), LossError> {
        std::fs::write(file, self.to_json()?)?;
        Ok(())
    }
}

fn invalid_format(err: serde_json::Error) -> LossError {
    LossError::Config(ConfigError::InvalidFormat(err.to_string()))
}

/// Recursively overwrite `base` with `overlay`.
///
/// Objects are merged key by key only when every overlay key exists in the base, so a
/// different enum variant (e.g. another initializer) replaces the default instead of
/// being mixed into it.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay))
            if overlay.keys().all(|key| base.contains_key(key)) =>
        {
            for (key, value) in overlay {
                if let Some(slot) = base.get_mut(&key) {
                    merge(slot, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
