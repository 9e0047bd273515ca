mod api;
mod app;
mod config;

use anyhow::Result;
use clap::Parser;
use utils::logging;
use utils::version;

use crate::config::Cli;
use crate::config::Commands;

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
    let _guard = logging::init();

    match cli.command {
        Commands::Serve(serve_args) => {
            tracing::info!("Starting kconmon controller {}", &**version::VERSION);
            app::serve(*serve_args).await
        }
        Commands::Agents(discovery_args) => app::list_agents(discovery_args).await,
        Commands::Agent(agent_args) => app::show_agent(agent_args).await,
    }
}
