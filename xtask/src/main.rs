use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build {
        /// Include the btleplug backend
        #[arg(long)]
        ble: bool,
    },
    /// Run the test suite
    Test,
    /// Run the CLI against the simulated device
    Simulate {
        /// Firmware image to send
        file: String,
        /// Extra arguments for `bleota simulate`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { ble } => {
            println!("Building project...");
            if *ble {
                cargo(&["build", "--workspace", "--features", "bleota-cli/ble"], "Build")?;
            } else {
                cargo(&["build", "--workspace"], "Build")?;
            }
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Simulate { file, args } => {
            println!("Running simulated update...");
            let mut cmd = vec!["run", "-p", "bleota-cli", "--", "simulate", file.as_str()];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Simulation")?;
        }
    }

    Ok(())
}
