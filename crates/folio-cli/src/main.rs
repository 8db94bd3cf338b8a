//! Folio CLI - render HTML documents through a supervised renderer.

mod reap;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Render HTML documents through a supervised renderer process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render HTML files and print one JSON artifact line per file
    Render {
        /// HTML files to render
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Renderer binary (defaults to FOLIO_RENDERER_PATH, then folio-worker)
        #[arg(long)]
        renderer: Option<PathBuf>,

        /// Argument passed to the renderer (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Per-document timeout in milliseconds (0 waits forever)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Renderer option as KEY=VALUE; JSON values are passed as JSON (repeatable)
        #[arg(long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,

        /// Do not terminate renderers orphaned by a previous run
        #[arg(long)]
        no_reap: bool,
    },

    /// Terminate renderer processes orphaned by a previous run
    Reap {
        /// Renderer binary (defaults to FOLIO_RENDERER_PATH, then folio-worker)
        #[arg(long)]
        renderer: Option<PathBuf>,

        /// Argument the renderer was started with (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format folio-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(folio_err) = err.downcast_ref::<folio_core::Error>() {
            anyhow::anyhow!("{}", folio_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Render {
            files,
            renderer,
            args,
            timeout_ms,
            options,
            no_reap,
        } => {
            let request = render::RenderRequest {
                files,
                renderer,
                args,
                timeout_ms,
                options,
                reap: !no_reap,
            };
            render::execute(request).await.map_err(format_error)?;
        }

        Commands::Reap { renderer, args } => {
            reap::execute(renderer.as_deref(), &args).map_err(format_error)?;
        }
    }

    Ok(())
}
