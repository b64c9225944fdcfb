pub mod parse;
pub mod types;

use regex::{Captures, Regex};
use std::path::{Path, PathBuf};

pub use parse::{load_config, parse_config_file, validate_config, ConfigError};
pub use types::Config;

const ENV_REFERENCE: &str = r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}";

fn env_reference() -> Option<Regex> {
    Regex::new(ENV_REFERENCE).ok()
}

/// Substitute `$env{NAME}` references with the variable's value.
///
/// References to unset variables stay in the text so they can be reported.
pub fn expand_env_vars(text: &str) -> String {
    let Some(re) = env_reference() else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &Captures| match std::env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => caps[0].to_string(),
    })
    .into_owned()
}

/// Names of `$env{...}` references still present in `text`, sorted and deduplicated.
pub fn unexpanded_env_vars(text: &str) -> Vec<String> {
    let Some(re) = env_reference() else {
        return Vec::new();
    };

    let mut names: Vec<String> = re
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// `~` and `~/...` resolved against the home directory; anything else as is.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let home = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map(|home| home.join(rest)),
        Err(_) => None,
    };
    home.unwrap_or_else(|| path.to_path_buf())
}

/// The config file to load: `explicit` if given, otherwise the first of the
/// per-user and system-wide locations that exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    let user = dirs::config_dir().map(|dir| dir.join("tail-forward").join("config.yml"));
    let system = Some(PathBuf::from("/etc/tail-forward/config.yml"));

    [user, system]
        .into_iter()
        .flatten()
        .find(|candidate| candidate.is_file())
}
