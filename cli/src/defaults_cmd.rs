use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use dbg_bridge_core::Config;
use dbg_bridge_core::defaults::DefaultsStore;

#[derive(Debug, Parser)]
pub struct DefaultsCli {
    /// Print compact JSON instead of the pretty form.
    #[arg(long = "compact", default_value_t = false)]
    compact: bool,
}

pub fn run(cli: DefaultsCli, config: &Config) -> Result<()> {
    let path = config
        .resolved_defaults_path()
        .context("no defaults path configured and no cache directory available")?;
    let mut store = DefaultsStore::new(path);
    let current = store.current();
    let serialized = if cli.compact {
        serde_json::to_string(current)?
    } else {
        serde_json::to_string_pretty(current)?
    };
    println!("{serialized}");
    Ok(())
}
