//! Environment names and the ports derived from them.
//!
//! A name is the only input to every derived resource: its directory under the
//! registry root and the TCP port its server listens on. Both derivations are
//! pure, so the same name always yields the same values on every platform.

use crate::StoreError;

/// Lowest port handed out by [`derive_port`].
pub const PORT_BASE: u16 = 1024;
const PORT_CEILING: u16 = 65535;

/// Maps an environment name to the port its server listens on.
///
/// Implementations must be pure: no state, no randomness, no salting.
pub trait PortScheme: Send + Sync {
    fn port_for(&self, name: &str) -> u16;
}

/// The default scheme: see [`derive_port`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryConcatPorts;

impl PortScheme for BinaryConcatPorts {
    fn port_for(&self, name: &str) -> u16 {
        derive_port(name)
    }
}

/// Derive the server port for `name`.
///
/// The binary representations of each character's code point (no leading
/// zeros) are concatenated and read as a single integer, which is then reduced
/// into `PORT_BASE..PORT_CEILING`. The reduction is applied per character so
/// arbitrarily long names never overflow.
///
/// Collisions between different names are possible and are not resolved here.
pub fn derive_port(name: &str) -> u16 {
    let range = u64::from(PORT_CEILING - PORT_BASE);
    let mut acc: u64 = 0;
    for ch in name.chars() {
        let code = u64::from(u32::from(ch));
        let bits = (u64::BITS - code.leading_zeros()).max(1);
        let shift = (1u64 << bits) % range;
        acc = (acc * shift + code) % range;
    }
    PORT_BASE + acc as u16
}

pub fn validate_env_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > 64 {
        return Err(StoreError::InvalidName(
            "environment name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(StoreError::InvalidName(format!(
            "'{name}' must match [a-zA-Z0-9_-]"
        )));
    }
    if name.starts_with('-') {
        return Err(StoreError::InvalidName(format!(
            "'{name}' must not start with '-'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ports() {
        assert_eq!(derive_port("alpha"), 24285);
        assert_eq!(derive_port("beta"), 46828);
        assert_eq!(derive_port("a"), 1121);
        assert_eq!(derive_port("tmp_pg_venv"), 18854);
        assert_eq!(derive_port("pg-12"), 38310);
        assert_eq!(derive_port("master"), 20788);
    }

    #[test]
    fn port_is_deterministic() {
        assert_eq!(derive_port("alpha"), derive_port("alpha"));
        assert_eq!(
            BinaryConcatPorts.port_for("feature_x"),
            derive_port("feature_x")
        );
    }

    #[test]
    fn port_stays_in_range() {
        let long = "z".repeat(64);
        for name in ["a", "Z", "0", "_", "-x", "REL_16_STABLE", long.as_str()] {
            let port = derive_port(name);
            assert!((PORT_BASE..PORT_CEILING).contains(&port), "{name} -> {port}");
        }
    }

    #[test]
    fn ports_spread_over_range() {
        let ports: std::collections::HashSet<u16> =
            (0..200).map(|i| derive_port(&format!("env{i}"))).collect();
        assert!(ports.len() > 150, "only {} distinct ports", ports.len());
    }

    #[test]
    fn valid_names() {
        assert!(validate_env_name("alpha").is_ok());
        assert!(validate_env_name("REL_16_STABLE").is_ok());
        assert!(validate_env_name("pg-12").is_ok());
        assert!(validate_env_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_env_name("").is_err());
        assert!(validate_env_name(&"a".repeat(65)).is_err());
        assert!(validate_env_name("has space").is_err());
        assert!(validate_env_name("a/b").is_err());
        assert!(validate_env_name(".hidden").is_err());
        assert!(validate_env_name("x;rm").is_err());
        assert!(validate_env_name("-flag").is_err());
    }
}
