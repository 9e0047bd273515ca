pub mod cli;
pub mod discovery;

pub use cli::Cli;
pub use cli::Commands;
pub use discovery::AgentArgs;
pub use discovery::DiscoveryArgs;
pub use discovery::ServeArgs;
