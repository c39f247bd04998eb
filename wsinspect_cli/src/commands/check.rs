//! Listen address validation

use anyhow::Result;
use console::style;
use wsinspect_listener::check_address;

/// Validate an address without binding it
pub fn run(address: &str) -> Result<()> {
    match check_address(address) {
        Ok(parsed) => {
            cliclack::log::success(format!("{} is a valid address", style(parsed).green()))?;
            Ok(())
        }
        Err(e) => {
            cliclack::log::error(format!("{}: {}", style(address).red(), e))?;
            anyhow::bail!("Invalid address: {}", address)
        }
    }
}
