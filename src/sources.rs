use anyhow::Result;

use crate::config::Config;

/// Print every configured source and whether it will be queried.
pub fn list_sources(config: &Config) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured. Add [sources.<name>] entries to the config file.");
        return Ok(());
    }

    println!("{:<16} {:<9} {:<6} URL", "SOURCE", "ENABLED", "TRUST");
    for (name, source) in &config.sources {
        println!(
            "{:<16} {:<9} {:<6.2} {}",
            name, source.enabled, source.trust_weight, source.url
        );
    }

    let enabled = config.sources.values().filter(|s| s.enabled).count();
    if enabled < config.collection.minimum_quorum {
        println!(
            "\nwarning: {} enabled source(s) but collection.minimum_quorum is {}; runs will fail",
            enabled, config.collection.minimum_quorum
        );
    }
    Ok(())
}
