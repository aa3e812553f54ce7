//! `slot-sentinel config`: inspect or create the config file.

use std::path::Path;

use anyhow::Result;

use crate::config::{default_config_path, resolve_config_path, FileConfig};

/// Print the effective configuration as JSON.
pub fn show(config: &FileConfig, explicit: Option<&Path>) -> Result<()> {
    match resolve_config_path(explicit) {
        Some(path) => eprintln!("  Config file: {}", path.display()),
        None => eprintln!("  Config file: (none, using defaults)"),
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Write a default config file.
pub fn init(explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    FileConfig::default().save(&path)?;
    eprintln!("  Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        init(Some(path.as_path()), false).unwrap();
        assert!(init(Some(path.as_path()), false).is_err());
        init(Some(path.as_path()), true).unwrap();
        assert_eq!(crate::config::load_file(&path).unwrap(), FileConfig::default());
    }
}
