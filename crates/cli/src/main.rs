use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // JSON command output goes to stdout; diagnostics stay on stderr.
    let filter =
        EnvFilter::try_from_env("EMBUDO_CLI_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
    embudo_cli::run()
}
