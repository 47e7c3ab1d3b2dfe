//! Default User-Agent string for transport traffic.
//!
//! Format: `<AppName>/<Version> (<OS>; Build <BuildId>)`. Hosts can override the
//! whole value through [`NetworkConfig::user_agent`](crate::NetworkConfig).

/// Builds the default User-Agent from the application identity.
#[must_use]
pub(crate) fn default_user_agent(app_name: &str, version: &str, os: &str, build_id: &str) -> String {
    format!("{app_name}/{version} ({os}; Build {build_id})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_format() {
        let ua = default_user_agent("Launcher", "2.4.1", "windows", "1187");
        assert_eq!(ua, "Launcher/2.4.1 (windows; Build 1187)");
    }

    #[test]
    fn test_crate_version_round_trips_through_format() {
        let ua = default_user_agent("netupdate", env!("CARGO_PKG_VERSION"), "linux", "dev");
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("netupdate/")
                .and_then(|s| s.split(' ').next())
                .unwrap_or_default(),
            "UA must contain crate version"
        );
    }
}
