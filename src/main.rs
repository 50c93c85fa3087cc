//! crdb-migrator CLI

use clap::Parser;

use crdb_migrator::commands::Cli;
use crdb_migrator::telemetry::init_logging;

#[tokio::main]
async fn main() {
    // The SQL probe and the kube client both need a process-wide provider.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = cli.run().await {
        tracing::error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}
