//! Subcommand implementations.

pub mod config_cmd;
pub mod console;
pub mod simulate;
pub mod watch;

use slot_sentinel::EventBus;

use crate::config::FileConfig;
use crate::relay::RelayForwarder;

/// Start relay forwarding when a relay URL is configured.
pub fn start_relay(config: &FileConfig, events: &EventBus) -> anyhow::Result<()> {
    if let Some(url) = &config.relay_url {
        let relay = RelayForwarder::new(url, config.relay_token.clone())?;
        relay.spawn(events.subscribe());
    }
    Ok(())
}
