use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "woly-server", about = "woly C&C server")]
pub struct Args {
    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Overrides the PORT environment variable.
    #[arg(long)]
    pub port: Option<u16>,
}
