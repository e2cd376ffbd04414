use std::sync::Arc;

use clap::Parser;

use caengine::constants::CAENGINE_DEFAULT_CONFIG_FILE;
use caengine::daemon::config::Config;
use caengine::daemon::start::start_caengine;

/// Runs the issuing engine for a single CA.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Override the path to the config file
    #[arg(short, long, value_name = "FILE", default_value = CAENGINE_DEFAULT_CONFIG_FILE)]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::create(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    };

    if let Err(e) = start_caengine(config).await {
        eprintln!("{}", e);
        ::std::process::exit(1);
    }
}
