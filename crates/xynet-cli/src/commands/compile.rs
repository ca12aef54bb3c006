//! Compile a template into a netlist, optionally exporting compile metadata

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use tracing::{info, warn};
use xynet_compiler::render::sanitize;
use xynet_compiler::{generate_with, CompileOutput, GenerateOptions};
use xynet_ir::BasicEvaluator;

use crate::config::CliConfig;
use crate::error::CliResult;
use crate::template::load_template;

/// Compile a template (.json or .toml) into a netlist
#[derive(Args, Debug)]
pub struct CompileCommand {
    /// Input template file
    pub input: PathBuf,

    /// Output netlist file
    #[arg(short, long)]
    pub output: PathBuf,

    /// RNG seed for connection sampling; 0 draws a fresh one
    #[arg(long, env = "XYNET_SEED")]
    pub seed: Option<u64>,

    /// Title written to the netlist (defaults to the root part name)
    #[arg(long)]
    pub name: Option<String>,

    /// Output expression `<part-or-alias>.<variable>[<index>]`; repeatable
    #[arg(short, long = "print", value_name = "EXPR")]
    pub print: Vec<String>,

    /// Write seed, serials and adjacency as JSON
    #[arg(long, value_name = "FILE")]
    pub metadata: Option<PathBuf>,

    /// Write one tab-separated adjacency matrix per connection part
    #[arg(long, value_name = "DIR")]
    pub adjacency_dir: Option<PathBuf>,
}

/// JSON form of a compile's metadata
#[derive(Debug, Serialize)]
pub struct CompileMetadata {
    /// Template file
    pub input: String,
    /// Netlist file
    pub netlist: String,
    /// Seed actually used
    pub seed: u64,
    /// Serials per part path
    pub serials: BTreeMap<String, Vec<u64>>,
    /// Realized connection count per connection part
    pub connections: BTreeMap<String, usize>,
    /// Adjacency dump per connection part
    pub adjacency: BTreeMap<String, String>,
}

impl CompileMetadata {
    fn new(input: &Path, netlist: &Path, output: &CompileOutput) -> Self {
        Self {
            input: input.display().to_string(),
            netlist: netlist.display().to_string(),
            seed: output.seed,
            serials: output.serials.clone(),
            connections: output.adjacency.iter().map(|(k, a)| (k.clone(), a.len())).collect(),
            adjacency: output.adjacency.iter().map(|(k, a)| (k.clone(), a.dump())).collect(),
        }
    }
}

impl CompileCommand {
    pub async fn execute(self, config: &CliConfig) -> CliResult<()> {
        let template = load_template(&self.input)?;

        let seed = self.seed.or(config.default_seed).unwrap_or(0);
        let outputs = if self.print.is_empty() {
            config.default_outputs.clone()
        } else {
            self.print.clone()
        };
        let mut options = GenerateOptions::new().with_seed(seed).with_outputs(outputs);
        if let Some(name) = &self.name {
            options = options.with_name(name.clone());
        }

        info!("Compiling {} (seed {})", self.input.display(), seed);
        let mut netlist = Vec::new();
        let output = generate_with(&template, &options, &BasicEvaluator, &mut netlist)?;

        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.output, &netlist)?;
        info!("Wrote {} bytes to {}", netlist.len(), self.output.display());

        if let Some(path) = &self.metadata {
            let metadata = CompileMetadata::new(&self.input, &self.output, &output);
            fs::write(path, serde_json::to_string_pretty(&metadata)?)?;
            info!("Wrote compile metadata to {}", path.display());
        }

        if let Some(dir) = &self.adjacency_dir {
            if output.adjacency.is_empty() {
                warn!("Template has no connection parts; no adjacency written");
            }
            fs::create_dir_all(dir)?;
            for (path, adjacency) in &output.adjacency {
                let file = dir.join(format!("{}.tsv", sanitize(path)));
                fs::write(&file, adjacency.dump())?;
                info!("Wrote {} ({} connections)", file.display(), adjacency.len());
            }
        }

        println!(
            "Compiled {} -> {} (seed {}, {} parts)",
            self.input.display(),
            self.output.display(),
            output.seed,
            output.serials.len()
        );
        Ok(())
    }
}
