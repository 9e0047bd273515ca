use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::discovery::AgentArgs;
use crate::config::discovery::DiscoveryArgs;
use crate::config::discovery::ServeArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the cluster and serve the agent directory over HTTP
    Serve(Box<ServeArgs>),
    /// List the agents currently running, then exit
    Agents(DiscoveryArgs),
    /// Look up one agent by pod name, then exit
    Agent(AgentArgs),
}
