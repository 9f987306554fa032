use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use gembed::adapter;
use gembed::client;
use gembed::config::Config;
use gembed::engine::native;
use gembed::{logging, memory};

#[derive(Parser)]
#[command(name = "gembed")]
#[command(version, about = "Inspect and exercise the gembed embedding bridge")]
struct Cli {
    /// Path to the JSON configuration file (defaults to $GEMBED_CONFIG, then gembed.json)
    #[arg(long, global = true, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered methods and models
    #[command(alias = "ls")]
    Methods,

    /// Embed texts and print the vectors as JSON
    Embed {
        /// Embedding method name
        #[arg(long, default_value = "cosine")]
        method: String,

        /// Model name under the method
        #[arg(long, default_value = "mini-v1")]
        model: String,

        /// Texts to embed
        #[arg(required = true)]
        texts: Vec<String>,
    },

    /// Write the effective configuration to a file
    InitConfig {
        /// Destination path
        path: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    logging::init(&config.log_filter);
    memory::configure(config.max_block_size);
    native::install(&config);

    match cli.command {
        Commands::Methods => {
            for method in native::registry().methods() {
                println!("{}", method.name);
                for model in &method.models {
                    let modalities: Vec<String> =
                        model.modalities.iter().map(ToString::to_string).collect();
                    println!(
                        "  {:<24} dim={:<5} {}",
                        model.name,
                        model.dimensions(),
                        modalities.join(",")
                    );
                }
            }
        }
        Commands::Embed {
            method,
            model,
            texts,
        } => {
            let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
            let embeddings = client::embed(adapter::global(), &method, &model, &texts)
                .context("Embedding failed")?;
            if embeddings.is_empty() {
                bail!("Engine returned no vectors");
            }
            info!("Embedded {} text(s) with {method}/{model}", embeddings.len());
            let out = serde_json::json!({
                "method": method,
                "model": model,
                "embeddings": embeddings,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::InitConfig { path } => {
            config.save(&path)?;
            println!("Wrote {path}");
        }
    }

    Ok(())
}
