use clap::Parser;

use drone_chef_client::cli::Args;
use drone_chef_client::ssh::discover_agent_socket;

#[tokio::main]
async fn main() {
    drone_chef_client::init_logging();

    let args = Args::parse();
    let plugin = args.into_plugin(|name| std::env::var(name).ok());

    if let Err(err) = plugin.exec(discover_agent_socket()).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
