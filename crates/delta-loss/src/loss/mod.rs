mod arcface;
mod crf;
mod cross_entropy;
mod ctc;
mod mask;
mod reduction;
mod sequence;

pub use arcface::*;
pub use crf::*;
pub use cross_entropy::*;
pub use ctc::*;
pub use mask::*;
pub use reduction::*;
pub use sequence::*;
