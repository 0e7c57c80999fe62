use thiserror::Error;

use crate::fetcher::FetchError;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("usage: {command} {usage}")]
    MissingArgument {
        command: &'static str,
        usage: &'static str,
    },
    #[error("usage: {0}")]
    Usage(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("user {0} does not exist")]
    UserNotFound(String),
    #[error("not logged in: run `login <name>` or `register <name>` first")]
    NotLoggedIn,
    #[error("user {0} already exists")]
    AlreadyExists(String),
    #[error("failed to fetch feed: {0}")]
    Fetch(#[from] FetchError),
    #[error("config error: {0:#}")]
    Config(anyhow::Error),
    #[error("{0:#}")]
    Store(#[from] anyhow::Error),
}

impl CommandError {
    /// Process exit status for this error. Every failure currently exits 1.
    pub fn exit_code(&self) -> u8 {
        1
    }
}
