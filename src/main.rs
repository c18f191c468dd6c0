use anyhow::{bail, Context, Result};
use clap::Parser;
use layerstack::config::{BuildConfig, EnvVar, LayerConfig, LocalDirConfig};
use layerstack::logging::{init_logging, BuildObserver, TracingObserver};
use layerstack::oci::{HttpRegistry, MemoryRegistry, Registry, RegistryAuth, RegistryConfig};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "layerstack")]
#[command(about = "Append layers to a base image or index and push the result")]
struct Args {
    /// JSON build config; flags below add to it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base image or index, empty for a blank image
    #[arg(long, env = "LAYERSTACK_BASE")]
    base: Option<String>,

    /// Result reference
    #[arg(short, long, env = "LAYERSTACK_TAG")]
    tag: Option<String>,

    /// os/arch[/variant], repeatable
    #[arg(short, long = "platform")]
    platforms: Vec<String>,

    /// Directory layer as PATH or PATH:CONTAINER_PATH, repeatable
    #[arg(short, long = "layer")]
    layers: Vec<String>,

    /// KEY=VALUE for the image environment, repeatable
    #[arg(short, long = "env")]
    envs: Vec<String>,

    /// Use plain HTTP for the registry
    #[arg(long)]
    insecure: bool,

    /// Push to an in-memory registry instead (empty base only)
    #[arg(long)]
    dry_run: bool,

    /// Write the artifact JSON here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn build_config(&self) -> Result<BuildConfig> {
        let mut config = match self.config {
            Some(ref path) => BuildConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BuildConfig::default(),
        };
        if let Some(ref base) = self.base {
            config.base = base.clone();
        }
        if let Some(ref tag) = self.tag {
            config.tag = tag.clone();
        }
        config.platforms.extend(self.platforms.iter().cloned());
        for layer in &self.layers {
            let (path, container_path) = match layer.split_once(':') {
                Some((p, c)) => (p.to_string(), Some(c.to_string())),
                None => (layer.clone(), None),
            };
            config.layers.push(LayerConfig {
                local_dir: Some(LocalDirConfig {
                    path,
                    container_path,
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        for kv in &self.envs {
            let Some((name, value)) = kv.split_once('=') else {
                bail!("--env expects KEY=VALUE, got {}", kv);
            };
            config.env.push(EnvVar {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs).map_err(|e| anyhow::anyhow!("logging setup failed: {}", e))?;

    let config = args.build_config()?;
    let registry: Arc<dyn Registry> = if args.dry_run {
        if !config.base.trim().is_empty() {
            bail!("--dry-run only works with an empty base");
        }
        Arc::new(MemoryRegistry::new())
    } else {
        Arc::new(HttpRegistry::new(RegistryConfig {
            auth: RegistryAuth::from_env(),
            insecure: args.insecure,
        })?)
    };
    let observer: Arc<dyn BuildObserver> = Arc::new(TracingObserver);

    let artifact = layerstack::build::run(&config, registry, observer).await?;
    let json = serde_json::to_string_pretty(&artifact)?;
    match args.output {
        Some(ref path) => fs::write(path, json + "\n")
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}
