use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::{self, Context};
use crate::config::ResolvedConfig;

/// rbxdev - Rojo and Roblox Studio development sessions
#[derive(Parser)]
#[command(name = "rbxdev")]
#[command(version, about = "rbxdev - Rojo and Roblox Studio development sessions")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Use this rbxdev.toml instead of searching upward
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Run as if started in DIR
    #[arg(long, global = true, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the place file with rojo
    Build {
        /// Write the place here instead of the configured output
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run `rojo serve` until interrupted
    Serve {
        #[arg(short, long, env = "RBXDEV_PORT")]
        port: Option<u16>,
    },

    /// Serve and run the watch script
    Watch {
        #[arg(short, long, env = "RBXDEV_PORT")]
        port: Option<u16>,
    },

    /// Build and open the place in Roblox Studio
    Open,

    /// Build, serve, watch and open Studio together
    Start {
        #[arg(short, long, env = "RBXDEV_PORT")]
        port: Option<u16>,
    },

    /// Write changes made in Studio back to the project
    Syncback {
        /// Place file to read (default: the configured output)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Sync even while Studio has the place open
        #[arg(long)]
        force: bool,
    },

    /// Stop running sessions and the rojo server for this project
    Stop,
}

impl Cli {
    pub fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(dir) = &self.dir {
            std::env::set_current_dir(dir)?;
        }
        let config = ResolvedConfig::load(self.config.as_deref(), None)?;

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async move {
            let ctx = Context::new(config);
            ctx.manager.install_signal_handlers();

            let result = dispatch(&ctx, self.command).await;
            // Nothing we started outlives the command, whichever way it ended.
            ctx.manager.cleanup().await;
            result
        })?;
        Ok(())
    }
}

async fn dispatch(ctx: &Context, command: Commands) -> commands::CommandResult {
    match command {
        Commands::Build { output } => commands::build::run(ctx, output).await,
        Commands::Serve { port } => commands::serve::run(ctx, port).await,
        Commands::Watch { port } => commands::watch::run(ctx, port).await,
        Commands::Open => commands::open::run(ctx).await,
        Commands::Start { port } => commands::start::run(ctx, port).await,
        Commands::Syncback { input, force } => commands::syncback::run(ctx, input, force).await,
        Commands::Stop => commands::stop::run(ctx).await,
    }
}
