//! Configuration error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = Error::Config("base_url is empty".into());
        assert_eq!(err.to_string(), "Configuration error: base_url is empty");
    }

    #[test]
    fn toml_error_converts() {
        let parse = toml::from_str::<toml::Table>("not = = toml").unwrap_err();
        let err: Error = parse.into();
        assert!(err.to_string().starts_with("TOML parse error:"), "got: {err}");
    }
}
