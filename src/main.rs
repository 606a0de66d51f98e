//! Stratus CLI — incremental image baking and stack deployment.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stratus",
    version,
    about = "Incremental cloud image baking — content-addressed phases, tag-based resumption"
)]
struct Cli {
    /// Log progress of remote operations
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log every remote call
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: stratus::cli::Commands,
}

fn init_tracing(verbose: bool, debug: bool) {
    let default = if debug {
        "stratus=debug"
    } else if verbose {
        "stratus=info"
    } else {
        "stratus=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug);
    if let Err(e) = stratus::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
