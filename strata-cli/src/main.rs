use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Build fragment tooling for the strata frontend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an operation spec into a build fragment directory
    Mkop {
        /// Path to the operation spec JSON file
        spec: PathBuf,

        /// Fragment directory to create (defaults to the current directory)
        outdir: Option<PathBuf>,
    },

    /// Assemble a fragment tree into a wire definition
    Marshal {
        /// Fragment directory containing a vertex.json
        fragment: PathBuf,

        /// Output file (defaults to stdout)
        output: Option<PathBuf>,
    },

    /// Inline referenced definition files into a single JSON document
    ReadInputs {
        /// JSON file mapping input names to definition file paths
        inputs: PathBuf,

        /// Output file (defaults to stdout)
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout is reserved for command output.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Mkop { spec, outdir } => commands::mkop(&spec, outdir.as_deref()),
        Commands::Marshal { fragment, output } => commands::marshal(&fragment, output.as_deref()),
        Commands::ReadInputs { inputs, output } => {
            commands::read_inputs(&inputs, output.as_deref())
        }
    }
}
