//! Show and update the saved configuration

use crate::config::{config_file, Config};
use crate::inspector::MessageFormat;
use anyhow::Result;
use console::style;

pub fn run(
    address: Option<String>,
    control_port: Option<u16>,
    format: Option<MessageFormat>,
) -> Result<()> {
    let changed = address.is_some() || control_port.is_some() || format.is_some();
    let config = Config::load()?.with_overrides(address, control_port, format);

    if changed {
        wsinspect_listener::check_address(&config.address)?;
        config.save()?;
        cliclack::log::success(format!(
            "Saved {}",
            style(config_file().display()).cyan()
        ))?;
    }

    println!("  {} {}", style("Address:").dim(), style(&config.address).green());
    println!("  {} {}", style("Control port:").dim(), style(config.control_port).green());
    println!("  {} {}", style("Format:").dim(), style(config.format.label()).green());

    Ok(())
}
