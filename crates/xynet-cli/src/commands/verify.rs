//! Structural template verification

use std::path::PathBuf;

use clap::Args;
use tracing::info;
use xynet_compiler::verify_template;
use xynet_ir::EquationSet;

use crate::error::CliResult;
use crate::template::load_template;

/// Verify a template file (.json or .toml)
#[derive(Args, Debug)]
pub struct VerifyCommand {
    /// Input template file
    pub input: PathBuf,

    /// Also print the template tree
    #[arg(long)]
    pub print: bool,
}

impl VerifyCommand {
    pub async fn execute(self) -> CliResult<()> {
        let template = load_template(&self.input)?;
        verify_template(&template)?;

        let (parts, connections) = count_parts(&template);
        info!("{} parts, {} of them connections", parts, connections);
        if self.print {
            print!("{}", template.to_text());
        }
        println!("Verification OK: {}", self.input.display());
        Ok(())
    }
}

fn count_parts(part: &EquationSet) -> (usize, usize) {
    part.parts.iter().map(count_parts).fold(
        (1, usize::from(part.is_connection())),
        |(p, c), (cp, cc)| (p + cp, c + cc),
    )
}
