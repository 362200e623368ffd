//! Line commands understood by the interactive host
//!
//! Plain text is a search query. Lines starting with `:` are commands:
//!
//! ```text
//! :unlock                      prompt for the master password and unlock
//! :lock                        lock the vault and stop the helper
//! :sync                        full resync and cache/icon refresh
//! :login | :logout             API-key login / CLI logout
//! :status                      CLI and helper status
//! :restart                     kill the helper; requires a new unlock
//! :server <url>                point the CLI at a self-hosted server
//! :apikey <client_id> <secret> store the API key
//! :password|:username|:totp <id>
//! :toggle <key> <on|off>       flip a preference
//! :stats | :help | :quit
//! ```

use std::str::FromStr;

use secrecy::SecretString;
use thiserror::Error;

use crate::config::Toggle;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command: :{0} (try :help)")]
    Unknown(String),

    #[error(":{command} needs <{argument}>")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// One parsed input line
#[derive(Debug)]
pub enum ShellCommand {
    Query(String),
    Unlock,
    Lock,
    Sync,
    Login,
    Logout,
    Status,
    Restart,
    Server(String),
    ApiKey {
        client_id: String,
        client_secret: SecretString,
    },
    Password(String),
    Username(String),
    Totp(String),
    Toggle { toggle: Toggle, value: bool },
    Stats,
    Help,
    Quit,
}

impl FromStr for ShellCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let Some(rest) = line.trim().strip_prefix(':') else {
            return Ok(ShellCommand::Query(line.trim().to_string()));
        };

        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();

        let command = match name {
            "unlock" => ShellCommand::Unlock,
            "lock" => ShellCommand::Lock,
            "sync" => ShellCommand::Sync,
            "login" => ShellCommand::Login,
            "logout" => ShellCommand::Logout,
            "status" => ShellCommand::Status,
            "restart" => ShellCommand::Restart,
            "stats" => ShellCommand::Stats,
            "help" => ShellCommand::Help,
            "quit" | "q" | "exit" => ShellCommand::Quit,
            "server" => ShellCommand::Server(required(words.next(), "server", "url")?),
            "apikey" => ShellCommand::ApiKey {
                client_id: required(words.next(), "apikey", "client_id")?,
                client_secret: SecretString::from(required(words.next(), "apikey", "secret")?),
            },
            "password" => ShellCommand::Password(required(words.next(), "password", "id")?),
            "username" => ShellCommand::Username(required(words.next(), "username", "id")?),
            "totp" => ShellCommand::Totp(required(words.next(), "totp", "id")?),
            "toggle" => {
                let key = required(words.next(), "toggle", "key")?;
                let toggle = key
                    .parse::<Toggle>()
                    .map_err(|_| ParseError::InvalidValue(format!("unknown preference {key}")))?;
                let value = match required(words.next(), "toggle", "on|off")?.as_str() {
                    "on" | "true" | "yes" => true,
                    "off" | "false" | "no" => false,
                    other => return Err(ParseError::InvalidValue(other.to_string())),
                };
                ShellCommand::Toggle { toggle, value }
            }
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

fn required(word: Option<&str>, command: &'static str, argument: &'static str) -> Result<String, ParseError> {
    word.map(str::to_string)
        .ok_or(ParseError::MissingArgument { command, argument })
}
