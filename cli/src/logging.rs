//! Tracing / logging initialisation.

use affscan_core::LogConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives from the config: `"info,affscan_evm=debug"` etc.
pub fn directives(config: &LogConfig) -> String {
    let mut directives = config.level.clone();
    for (component, level) in &config.components {
        directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
    }
    directives
}

/// Initialise tracing once at startup. `RUST_LOG` wins over the config.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(config)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn component_overrides_use_crate_names() {
        let config = LogConfig {
            level: "warn".into(),
            components: BTreeMap::from([
                ("affscan-core".to_string(), "debug".to_string()),
                ("affscan-evm".to_string(), "trace".to_string()),
            ]),
            json: true,
        };
        assert_eq!(directives(&config), "warn,affscan_core=debug,affscan_evm=trace");
    }
}
