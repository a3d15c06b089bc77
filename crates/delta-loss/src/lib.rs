#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![recursion_limit = "135"]

//! Training losses for speech and NLP classification models built on Burn.
//!
//! | Loss | Use case |
//! |---|---|
//! | [`CrossEntropyLoss`](loss::CrossEntropyLoss) | Classification and per-frame sequence classification |
//! | [`CtcLoss`](loss::CtcLoss) | Alignment-free sequence labelling (ASR) |
//! | [`Crf`](loss::Crf) | Linear-chain CRF tagging (NER, slot filling) |
//! | [`SequenceLoss`](loss::SequenceLoss) | Sequence-to-sequence decoders |
//! | [`ArcFace`](loss::ArcFace) | Speaker / face embeddings with an angular margin |

#[macro_use]
extern crate derive_new;

extern crate alloc;

/// Loss selection from serialized configuration.
pub mod config;

/// Loss functions.
pub mod loss;

mod error;

pub use error::LossError;

/// Backend for test cases
#[cfg(test)]
pub type TestBackend = burn::backend::NdArray<f32>;

/// Backend for autodiff test cases
#[cfg(test)]
pub type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
