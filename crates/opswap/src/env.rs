//! Process-wide switches read from the environment once and cached.

use std::env;
use std::sync::OnceLock;

static OPSWAP_VERIFY_CONTRACTS: OnceLock<bool> = OnceLock::new();

/// Interprets the usual truthy spellings (`1`, `true`, `yes`, `on`), case-insensitively.
pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Reads a boolean flag, returning `default` when the variable is unset or blank.
pub fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => default,
    }
}

/// Whether the interpreter checks every operator output against its declared meta.
///
/// Controlled by `OPSWAP_VERIFY_CONTRACTS`; defaults to on in debug builds.
pub fn verify_contracts_enabled() -> bool {
    *OPSWAP_VERIFY_CONTRACTS
        .get_or_init(|| flag("OPSWAP_VERIFY_CONTRACTS", cfg!(debug_assertions)))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "nope"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
