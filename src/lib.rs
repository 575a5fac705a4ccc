//! Neural style transfer: a convolutional feature network, Gram-matrix style
//! and activation content losses, and a box-constrained L-BFGS optimizer
//! driving the candidate image.

pub mod ml;

pub use crate::ml::config::{StyleWeights, TransferOptions};
pub use crate::ml::error::{Result, StyleError};
pub use crate::ml::network::{Network, NetworkBuilder};
pub use crate::ml::transfer::{StyleTransfer, TransferReport};
pub use crate::ml::transformers::Transformer;
