//! Device registry listing

use clap::Args;
use xynet_compiler::list_devices;

use crate::error::CliResult;

/// List device primitives
#[derive(Args, Debug)]
pub struct DevicesCommand {
    /// Show nodes, parameter docs and internal variables
    #[arg(long)]
    pub detailed: bool,
}

impl DevicesCommand {
    pub async fn execute(self) -> CliResult<()> {
        println!("Registered devices:");
        for device in list_devices() {
            let kind = if device.connection { "connection" } else { "compartment" };
            if self.detailed {
                println!("- {} ({} {} level {}, {}) {{", device.name, device.device, device.model, device.level, kind);
                println!("    nodes: {}", device.nodes.join(" "));
                for param in device.params {
                    println!("    {} // {}", param.name, param.doc);
                }
                if !device.internals.is_empty() {
                    println!("    internals: {}", device.internals.join(", "));
                }
                println!("  }} // {}", device.doc);
            } else {
                let params: Vec<&str> = device.params.iter().map(|p| p.name).collect();
                println!("- {} ({}) {{ {} }}", device.name, kind, params.join(", "));
            }
        }

        if self.detailed {
            println!("\nEquation tags:");
            println!("- device.param = NAME: variable supplies a device parameter");
            println!("- device.node = k: variable is the voltage of device node k");
            println!("- device.var = NAME: variable reads a device internal");
            println!("- device.input = k: variable is a current injected into node k");
        }
        Ok(())
    }
}
