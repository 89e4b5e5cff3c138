use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use ropsynth::SynthConfig;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

/// ROP chain synthesizer
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Write a template configuration
    New {
        config: PathBuf,
        /// Binary to scan for gadgets
        #[clap(short, long)]
        library: Option<String>,
    },
    /// Synthesize a chain and print it as JSON
    Synth {
        config: PathBuf,
        /// Replay a found chain before printing it
        #[clap(long)]
        verify: bool,
    },
}

fn init_logging(level: Level) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
  tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
  let args = Args::parse();
  match args.command {
    Command::New { config, library } => {
      init_logging(Level::INFO);
      let template = SynthConfig::template(library.as_deref().unwrap_or("libc.so.6"));
      fs::write(&config, toml::to_string_pretty(&template)?)
        .with_context(|| format!("unable to write {}", config.display()))?;
      event!(Level::INFO, "wrote {}", config.display());
    }
    Command::Synth { config, verify } => {
      let config = SynthConfig::load(&config).with_context(|| format!("unable to load {}", config.display()))?;
      init_logging(config.meta.log_level.into());
      let params = config.resolve()?;
      let result = params.run()?;
      if let (true, Some(solution)) = (verify, result.solution()) {
        let replayed = params.verify(solution)?;
        event!(Level::INFO, "replay {}", if replayed { "succeeded" } else { "failed" });
      }
      println!("{}", serde_json::to_string_pretty(&result)?);
    }
  }
  Ok(())
}
