use anyhow::Result;
use clap::Parser;
use device_plugin::app;
use device_plugin::config::Cli;
use device_plugin::config::Config;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = match &cli.log_file {
        Some(log_file) => Some(utils::logging::init_with_file(log_file)?),
        None => {
            utils::logging::init();
            None
        }
    };

    tracing::info!(
        "Starting GPU device plugin {} ({})",
        &**version::VERSION,
        version::branch()
    );

    let config = Config::load(&cli)?;
    tracing::info!("Running with config: {config:?}");

    app::run(config).await
}
