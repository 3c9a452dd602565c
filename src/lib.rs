pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dense_stack;
pub mod distributions;
pub mod evaluate;
pub mod gmvae;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod train;
pub mod vae;

pub use candle_core;
pub use candle_nn;
