//! entrypoint for udpgw

use std::sync::Arc;

use clap::Parser;
use rama_error::BoxError;

use udpgw::config::Config;
use udpgw::error::ErrorWithExitCode;

#[derive(Debug, Parser)]
#[command(name = "udpgw")]
#[command(bin_name = "udpgw")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    udpgw::trace::init_tracing(cli.config.loglevel);

    #[allow(clippy::exit)]
    match udpgw::server::run(Arc::new(cli.config)).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(err) = err.downcast_ref::<ErrorWithExitCode>() {
                tracing::error!("exit with error ({}): {err}", err.exit_code());
                std::process::exit(err.exit_code());
            } else {
                tracing::error!("exit with error: {err}");
                std::process::exit(1);
            }
        }
    }
}
