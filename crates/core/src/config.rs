//! Environment helpers shared by the crates' config loaders.

use std::env;
use std::str::FromStr;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Read an env var, treating empty values as unset.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Read and parse an env var. Unparseable values are logged and ignored.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_opt(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_are_unset() {
        env::set_var("RELINK_TEST_EMPTY", "  ");
        assert_eq!(env_opt("RELINK_TEST_EMPTY"), None);
        env::remove_var("RELINK_TEST_EMPTY");
    }

    #[test]
    fn parses_numbers_and_ignores_garbage() {
        env::set_var("RELINK_TEST_NUM", " 42 ");
        assert_eq!(env_parse::<u64>("RELINK_TEST_NUM"), Some(42));
        env::set_var("RELINK_TEST_NUM", "forty-two");
        assert_eq!(env_parse::<u64>("RELINK_TEST_NUM"), None);
        env::remove_var("RELINK_TEST_NUM");
    }
}
