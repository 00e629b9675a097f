pub mod aspect_buckets;
pub mod callbacks;
pub mod checkpoint;
pub mod concept_data_loader;
pub mod ddpm_scheduler;
pub mod latent_cache;
pub mod module;
pub mod optim;
pub mod options;
pub mod precision;
pub mod safetensors_io;
pub mod sample_callback;
pub mod trainer;
pub mod tuner;

// Re-export key types
pub use callbacks::{Callback, CallbackContext, FitProgress};
pub use checkpoint::{CheckpointState, ModelCheckpoint};
pub use module::{GeneratedSample, Shard, TrainBatch, TrainableModule};
pub use optim::AdamW;
pub use options::{Accelerator, CheckpointMode, CheckpointOptions, TrainerFlags, TrainerOptions};
pub use precision::{GradScaler, Precision, PrecisionPolicy};
pub use sample_callback::SampleCallback;
pub use trainer::Trainer;
pub use tuner::TuneResult;
