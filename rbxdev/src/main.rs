mod cli;
mod commands;
mod config;
mod output;
mod paths;
mod rojo;
mod studio;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use commands::CommandError;

fn main() {
    let cli = Cli::parse();

    crate::output::set_verbose(cli.verbose);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("info")
            } else {
                EnvFilter::new("warn")
            }
        }))
        .with_target(false)
        .init();

    if let Err(e) = cli.run() {
        let code = match e.downcast_ref::<CommandError>() {
            Some(err) if err.is_silent() => err.exit_code(),
            Some(err) => {
                crate::output::error_stderr(&err.to_string());
                err.exit_code()
            }
            None => {
                crate::output::error_stderr(&e.to_string());
                1
            }
        };
        std::process::exit(code);
    }
}
