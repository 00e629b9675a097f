pub mod config;
pub mod distributed;
pub mod driver;
pub mod loggers;
pub mod models;
pub mod run;
pub mod trainers;

// Re-export common types
pub use config::{load_with_defaults, resolve_config, Config, ConfigError, ConfigWarning};
pub use distributed::ProcessRole;
pub use driver::{run, RunReport, RunState, TrainArgs};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Install the process-wide logger. `RUST_LOG` overrides the default `info` filter.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
