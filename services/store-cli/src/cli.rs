use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "store-cli")]
#[command(version, about = "StoreManager API client")]
pub struct Cli {
    /// Config file
    #[arg(long, global = true, env = "CONFIG_PATH", default_value = "store-cli.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Show the stored session without calling the server
    Status,

    /// Sign in; the password comes from STORE_PASSWORD or [login].password_file
    Login {
        /// Defaults to [login].email
        email: Option<String>,
    },

    /// Sign out of this device
    Logout,

    /// Sign out of every device
    LogoutAll,

    /// Fetch the profile and update the cached copy
    Profile,

    /// GET an API path and print the JSON body
    Get {
        path: String,
        /// Query parameters as key=value
        #[arg(value_parser = parse_query_param)]
        query: Vec<(String, String)>,
    },

    /// Upload a CSV or Excel file as multipart/form-data
    Import {
        path: String,
        file: PathBuf,
        /// Column mappings as a JSON object
        mappings: Option<String>,
    },
}

fn parse_query_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("query parameter must be key=value, got: {raw}"))
}
