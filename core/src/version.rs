//! Version information

/// Crate version (semver format)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Replication wire format version, bumped when [`crate::protocol`] changes
pub const PROTOCOL_VERSION: u32 = 1;

/// Git commit hash (if available)
pub const GIT_HASH: Option<&str> = option_env!("GIT_HASH");

/// Version line shown by the CLI
pub fn version_string() -> String {
    let mut version = format!("dsync v{} (protocol {})", VERSION, PROTOCOL_VERSION);
    if let Some(hash) = GIT_HASH {
        version.push_str(&format!(" {}", &hash[..hash.len().min(8)]));
    }
    if cfg!(debug_assertions) {
        version.push_str(" [debug]");
    }
    version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string() {
        assert!(version_string().starts_with("dsync v0.1.0 (protocol 1)"));
    }
}
