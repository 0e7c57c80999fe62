use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::config::{Config, ConfigStore};
use crate::db::{Database, User};
use crate::error::CommandError;
use crate::fetcher::Fetcher;

/// Everything a handler may touch during one invocation.
pub struct State {
    pub db: Database,
    pub config: Config,
    pub config_store: ConfigStore,
    pub fetcher: Fetcher,
}

impl State {
    /// Writes the config with `name` as current user, then adopts it.
    pub fn set_current_user(&mut self, name: &str) -> Result<(), CommandError> {
        let next = self.config.with_user(name);
        self.config_store
            .write(&next)
            .map_err(CommandError::Config)?;
        self.config = next;
        Ok(())
    }

    /// Resolves the configured user against the database.
    pub async fn current_user(&self) -> Result<User, CommandError> {
        let name = self.config.current_user().ok_or(CommandError::NotLoggedIn)?;
        self.db
            .get_user(name)
            .await
            .with_context(|| format!("couldn't look up user {}", name))?
            .ok_or(CommandError::NotLoggedIn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Builds a command from process arguments with the program name already stripped.
    pub fn from_args<I>(args: I) -> Result<Self, CommandError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let name = args
            .next()
            .ok_or_else(|| CommandError::Usage("gator <command> [args...]".to_string()))?;
        Ok(Self {
            name,
            args: args.collect(),
        })
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, state: &mut State, args: &[String]) -> Result<(), CommandError>;
}

/// Name to handler dispatch table.
#[derive(Default)]
pub struct Commands {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Commands {
    pub fn new() -> Self {
        Self::default()
    }

    /// A later registration under the same name replaces the earlier one.
    pub fn register<H>(&mut self, name: &str, handler: H)
    where
        H: Handler + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub async fn run(&self, state: &mut State, command: &Command) -> Result<(), CommandError> {
        let handler = self
            .handlers
            .get(&command.name)
            .ok_or_else(|| CommandError::UnknownCommand(command.name.clone()))?;

        debug!("Dispatching command {} with args {:?}", command.name, command.args);
        handler.execute(state, &command.args).await
    }
}
