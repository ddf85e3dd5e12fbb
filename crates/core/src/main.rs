// Coral is an open source distributed map-reduce engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coral::config;
use coral::entrypoint;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node. The node joins (or seeds) the chord ring,
    /// contests the naming leadership and serves map-reduce tasks.
    Server {
        #[clap(long)]
        config_path: Option<String>,
    },

    /// Submit a map-reduce job to a running cluster and await the results.
    Client {
        #[clap(long)]
        config_path: Option<String>,

        /// Input file with one record per line. Falls back to a small
        /// built-in example corpus.
        #[clap(long)]
        file: Option<String>,
    },
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse {path}"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Server { config_path } => {
            let mut config: config::ServerConfig = match config_path {
                Some(path) => load_toml(&path)?,
                None => config::ServerConfig::default(),
            };
            config.apply_env();

            entrypoint::server::run(config)?;
        }
        Commands::Client { config_path, file } => {
            let mut config: config::ClientConfig = match config_path {
                Some(path) => load_toml(&path)?,
                None => config::ClientConfig::default(),
            };
            config.apply_env();

            if let Some(file) = file {
                config.data_path = Some(file);
            }

            entrypoint::client::run(config)?;
        }
    }

    Ok(())
}
