//! CLI command implementations

pub mod marshal;
pub mod mkop;
pub mod read_inputs;

pub use marshal::marshal;
pub use mkop::mkop;
pub use read_inputs::read_inputs;

use anyhow::{Context, Result};
use std::path::Path;

/// Write `data` to `output`, or to stdout when no path is given.
fn write_output(output: Option<&Path>, data: &str) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, data)
            .with_context(|| format!("writing output to {}", path.display())),
        None => {
            println!("{}", data);
            Ok(())
        }
    }
}
