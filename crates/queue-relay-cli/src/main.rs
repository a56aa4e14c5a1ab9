use queue_relay_cli::{run_cli, CliError};
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!("{}", e);

        let exit_code = match e {
            CliError::Configuration { .. } => 1,
            CliError::Provisioning { .. } => 2,
            CliError::Startup(_) => 3,
            CliError::Runtime { .. } => 4,
        };

        std::process::exit(exit_code);
    }
}
