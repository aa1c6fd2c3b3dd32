// seed-ping node binary
use clap::Parser;
use seed_ping::cli::{Cli, CliApp};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut app = CliApp::new(&cli.global);
    if let Err(e) = app.run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
