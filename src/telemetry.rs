use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Output format of the log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing. Logs go to stderr so that mutated objects can be written to stdout.
pub fn init(format: LogFormat) {
    let env_filter = env_filter();

    // Decide on layers
    let logger = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };
    let collector = Registry::default().with(logger).with(env_filter);

    // Initialize tracing
    if let Err(err) = tracing::subscriber::set_global_default(collector) {
        eprintln!("tracing was already initialized: {err}");
    }
}
