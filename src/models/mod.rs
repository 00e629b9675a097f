//! Model implementations

pub mod denoiser;
pub mod stable_diffusion;

pub use denoiser::{Denoiser, DenoiserConfig};
pub use stable_diffusion::{StableDiffusionModel, CORE_NAME};
