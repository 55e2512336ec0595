pub mod attention;
pub mod builder;
pub mod gpt;
pub mod loss;
pub mod ops;

pub use builder::{init_gpt, pick_device};
pub use gpt::{GPTConfig, GPT};
pub use loss::{cross_entropy_loss, LossReduction};

pub type TokenId = u32;
