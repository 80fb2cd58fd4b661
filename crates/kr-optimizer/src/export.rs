//! CSV export of result and cost tables.

use std::path::{Path, PathBuf};
use tracing::info;

use kr_types::{DataTable, KrResult};

use crate::group::SimulationGroup;
use crate::optimizer::Optimizer;

pub const OPTIMIZER_COSTS_FILE: &str = "optimizer_cost_data.csv";

pub fn write_table_csv(table: &DataTable, path: &Path) -> KrResult<()> {
    table.write_csv(path, "simulation")?;
    info!("Wrote {} row(s) to {}", table.num_rows(), path.display());
    Ok(())
}

/// Performance table of a group, written to `<dir>/<group name>.csv`.
pub fn export_group(group: &SimulationGroup, dir: &Path) -> KrResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.csv", file_stem(group.name())));
    write_table_csv(group.results_table(), &path)?;
    Ok(path)
}

/// The optimizer cost table plus one cost table per finished step.
pub fn export_optimizer(optimizer: &Optimizer, dir: &Path) -> KrResult<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    let path = dir.join(OPTIMIZER_COSTS_FILE);
    write_table_csv(&optimizer.cost_data()?, &path)?;
    written.push(path);

    for (k, step) in optimizer.steps().iter().enumerate() {
        if let Some(table) = step.cost_data() {
            let path = dir.join(format!("step_{k}_cost_data.csv"));
            write_table_csv(table, &path)?;
            written.push(path);
        }
    }
    Ok(written)
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
