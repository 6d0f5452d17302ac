use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "cbt-safety";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable pointing at a JSON policy file.
pub const POLICY_ENV_VAR: &str = "CBT_SAFETY_POLICY";

/// File name of the policy inside the application data directory.
pub const POLICY_FILE_NAME: &str = "policy.json";

/// Refetch attempts before the merge engine gives up and asks for a refresh.
pub const DEFAULT_REFETCH_ATTEMPTS: u32 = 3;

/// Overall deadline for one refetch-and-replace cycle.
pub const DEFAULT_REFETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the optional secondary crisis classifier.
pub const DEFAULT_SECONDARY_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of a conversation session inbox.
pub const SESSION_INBOX_CAPACITY: usize = 64;

/// Get the application data directory (`<data dir>/cbt-safety`).
/// Returns `None` on platforms without a resolvable data directory.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_NAME))
}

/// Default location of the externally editable safety policy.
pub fn policy_path() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join(POLICY_FILE_NAME))
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "cbt_safety_lib=info,cbt_safety=info,warn"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_path_under_app_data() {
        let (Some(policy), Some(app)) = (policy_path(), app_data_dir()) else {
            return;
        };
        assert!(policy.starts_with(app));
        assert!(policy.ends_with(POLICY_FILE_NAME));
    }

    #[test]
    fn app_data_dir_named_after_app() {
        if let Some(dir) = app_data_dir() {
            assert!(dir.ends_with(APP_NAME));
        }
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn default_filter_mentions_crate() {
        assert!(default_log_filter().contains("cbt_safety_lib"));
    }
}
