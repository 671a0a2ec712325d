// SPDX-FileCopyrightText: 2026 Metered Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./metered.toml` > `~/.config/metered/metered.toml` > `/etc/metered/metered.toml`
//! with environment variable overrides via `METERED_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::MeteredConfig;

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/metered/metered.toml` (system-wide)
/// 3. `~/.config/metered/metered.toml` (user XDG config)
/// 4. `./metered.toml` (local directory)
/// 5. `METERED_*` environment variables
pub fn load_config() -> Result<MeteredConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no XDG lookup, no env vars).
pub fn load_config_from_str(toml_content: &str) -> Result<MeteredConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(MeteredConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<MeteredConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(MeteredConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Build the Figment used for the XDG lookup, before extraction.
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(MeteredConfig::default()))
        .merge(Toml::file("/etc/metered/metered.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("metered/metered.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("metered.toml"))
        .merge(env_provider())
}

/// Environment variable provider mapping `METERED_<SECTION>_<KEY>` to `section.key`.
///
/// Uses `Env::map()` rather than `Env::split("_")` because key names contain
/// underscores: `METERED_RECONCILE_GRACE_PERIOD_SECS` must map to
/// `reconcile.grace_period_secs`, not `reconcile.grace.period.secs`.
/// The key arrives with its original case, so it is lowercased first.
pub(crate) fn env_provider() -> Env {
    Env::prefixed("METERED_").map(|key| map_env_key(key.as_str()).into())
}

const SECTIONS: [&str; 5] = ["service", "storage", "ledger", "driver", "reconcile"];

fn map_env_key(key: &str) -> String {
    let key = key.to_ascii_lowercase();
    for section in SECTIONS {
        if let Some(field) = key
            .strip_prefix(section)
            .and_then(|rest| rest.strip_prefix('_'))
        {
            return format!("{section}.{field}");
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_case_keys_map_into_sections() {
        assert_eq!(
            map_env_key("RECONCILE_GRACE_PERIOD_SECS"),
            "reconcile.grace_period_secs"
        );
        assert_eq!(map_env_key("DRIVER_MAX_ATTEMPTS"), "driver.max_attempts");
        assert_eq!(map_env_key("storage_wal_mode"), "storage.wal_mode");
    }

    #[test]
    fn keys_outside_a_section_are_only_lowercased() {
        assert_eq!(map_env_key("VERBOSE"), "verbose");
        assert_eq!(map_env_key("LEDGERS_X"), "ledgers_x");
    }
}
