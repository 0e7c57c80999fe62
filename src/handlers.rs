//! One [`Handler`] per CLI command.

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::aggregator;
use crate::commands::{Commands, Handler, State};
use crate::db::{is_unique_violation, Feed, FeedListing, NewFeed, NewUser, Post, User};
use crate::error::CommandError;
use crate::fetcher::DEFAULT_FETCH_TIMEOUT;

/// Fetched by `agg` when no argument is given.
pub const SEED_FEED_URL: &str = "https://www.wagslane.dev/index.xml";

const DEFAULT_BROWSE_LIMIT: i64 = 2;

/// Registry with every command wired up.
pub fn registry() -> Commands {
    let mut commands = Commands::new();
    commands.register("login", Login);
    commands.register("register", Register);
    commands.register("reset", Reset);
    commands.register("users", Users);
    commands.register("addfeed", AddFeed);
    commands.register("feeds", Feeds);
    commands.register("agg", Agg);
    commands.register("browse", Browse);
    commands
}

/// First argument as a user name. Blank names count as missing; names with
/// surrounding whitespace are rejected so the stored name matches the config.
fn required_arg<'a>(
    args: &'a [String],
    command: &'static str,
    usage: &'static str,
) -> Result<&'a str, CommandError> {
    let name = args
        .first()
        .map(String::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or(CommandError::MissingArgument { command, usage })?;
    if name.trim() != name {
        return Err(CommandError::Usage(format!(
            "{} {}, name {:?} has leading or trailing whitespace",
            command, usage, name
        )));
    }
    Ok(name)
}

pub struct Login;

#[async_trait]
impl Handler for Login {
    async fn execute(&self, state: &mut State, args: &[String]) -> Result<(), CommandError> {
        let name = required_arg(args, "login", "<name>")?;

        state
            .db
            .get_user(name)
            .await
            .with_context(|| format!("couldn't look up user {}", name))?
            .ok_or_else(|| CommandError::UserNotFound(name.to_string()))?;

        state.set_current_user(name)?;
        info!("Switched current user to {}", name);
        println!("User switched to {}", name);
        Ok(())
    }
}

pub struct Register;

#[async_trait]
impl Handler for Register {
    async fn execute(&self, state: &mut State, args: &[String]) -> Result<(), CommandError> {
        let name = required_arg(args, "register", "<name>")?;

        let existing = state
            .db
            .get_user(name)
            .await
            .with_context(|| format!("couldn't look up user {}", name))?;
        if existing.is_some() {
            return Err(CommandError::AlreadyExists(name.to_string()));
        }

        // The config write runs inside the insert transaction so a failed
        // write leaves no user behind.
        let next = state.config.with_user(name);
        let store = &state.config_store;
        let user = state
            .db
            .create_user_then(NewUser::new(name), |_| store.write(&next))
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    CommandError::AlreadyExists(name.to_string())
                } else {
                    CommandError::Store(err.context(format!("couldn't register user {}", name)))
                }
            })?;
        state.config = next;

        info!("Registered user {} ({})", user.name, user.id);
        println!("User created:");
        print_user(&user);
        Ok(())
    }
}

pub struct Reset;

#[async_trait]
impl Handler for Reset {
    async fn execute(&self, state: &mut State, _args: &[String]) -> Result<(), CommandError> {
        let removed = state
            .db
            .reset_users()
            .await
            .context("couldn't reset users")?;

        warn!("Deleted all {} users", removed);
        println!("Database reset: removed {} user(s)", removed);
        Ok(())
    }
}

pub struct Users;

#[async_trait]
impl Handler for Users {
    async fn execute(&self, state: &mut State, _args: &[String]) -> Result<(), CommandError> {
        let users = state.db.get_users().await.context("couldn't list users")?;

        for line in format_users(&users, state.config.current_user()) {
            println!("{}", line);
        }
        Ok(())
    }
}

/// One line per user; the current one is suffixed with `(current)`.
pub fn format_users(users: &[User], current: Option<&str>) -> Vec<String> {
    users
        .iter()
        .map(|user| {
            if Some(user.name.as_str()) == current {
                format!("* {} (current)", user.name)
            } else {
                format!("* {}", user.name)
            }
        })
        .collect()
}

pub struct AddFeed;

#[async_trait]
impl Handler for AddFeed {
    async fn execute(&self, state: &mut State, args: &[String]) -> Result<(), CommandError> {
        let [name, url] = args else {
            return Err(CommandError::Usage("addfeed <name> <url>".to_string()));
        };

        let user = state.current_user().await?;
        let feed = state
            .db
            .create_feed(NewFeed::new(name, url, user.id))
            .await
            .with_context(|| format!("couldn't create feed {}", name))?;

        info!("Added feed {} ({}) for {}", feed.name, feed.url, user.name);
        println!("Feed created:");
        print_feed(&feed, &user);
        Ok(())
    }
}

pub struct Feeds;

#[async_trait]
impl Handler for Feeds {
    async fn execute(&self, state: &mut State, _args: &[String]) -> Result<(), CommandError> {
        let feeds = state.db.get_feeds().await.context("couldn't list feeds")?;

        if feeds.is_empty() {
            println!("No feeds found.");
            return Ok(());
        }
        for line in format_feeds(&feeds) {
            println!("{}", line);
        }
        Ok(())
    }
}

pub fn format_feeds(feeds: &[FeedListing]) -> Vec<String> {
    feeds
        .iter()
        .map(|feed| {
            let fetched = feed
                .last_fetched_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            format!(
                "* {} ({}) added by {}, last fetched {}",
                feed.name, feed.url, feed.user_name, fetched
            )
        })
        .collect()
}

#[derive(Debug, PartialEq)]
pub enum AggMode {
    /// Fetch a single URL once and print it.
    Once(String),
    /// Poll stored feeds every interval.
    Every(std::time::Duration),
}

impl AggMode {
    pub fn from_args(args: &[String]) -> Result<Self, CommandError> {
        match args {
            [] => Ok(AggMode::Once(SEED_FEED_URL.to_string())),
            [arg] if arg.contains("://") => Ok(AggMode::Once(arg.clone())),
            [arg] => aggregator::parse_interval(arg).map(AggMode::Every).ok_or_else(|| {
                CommandError::Usage(format!(
                    "agg [url | interval], invalid interval {:?} (e.g. 30s, 5m, 1h)",
                    arg
                ))
            }),
            _ => Err(CommandError::Usage("agg [url | interval]".to_string())),
        }
    }
}

pub struct Agg;

#[async_trait]
impl Handler for Agg {
    async fn execute(&self, state: &mut State, args: &[String]) -> Result<(), CommandError> {
        match AggMode::from_args(args)? {
            AggMode::Once(url) => {
                let document = state.fetcher.fetch(&url, DEFAULT_FETCH_TIMEOUT).await?;
                print!("{}", document);
            }
            AggMode::Every(interval) => {
                aggregator::run(
                    &state.db,
                    &state.fetcher,
                    interval,
                    DEFAULT_FETCH_TIMEOUT,
                    shutdown_signal(),
                )
                .await;
            }
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

pub struct Browse;

#[async_trait]
impl Handler for Browse {
    async fn execute(&self, state: &mut State, args: &[String]) -> Result<(), CommandError> {
        let limit = match args {
            [] => DEFAULT_BROWSE_LIMIT,
            [raw] => raw
                .parse::<i64>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| CommandError::Usage("browse [limit]".to_string()))?,
            _ => return Err(CommandError::Usage("browse [limit]".to_string())),
        };

        let user = state.current_user().await?;
        let posts = state
            .db
            .get_posts_for_user(user.id, limit)
            .await
            .context("couldn't list posts")?;

        println!("Found {} post(s) for {}:", posts.len(), user.name);
        for post in &posts {
            print_post(post);
        }
        Ok(())
    }
}

fn print_user(user: &User) {
    println!(" * ID:      {}", user.id);
    println!(" * Name:    {}", user.name);
    println!(" * Created: {}", user.created_at.to_rfc3339());
}

fn print_feed(feed: &Feed, user: &User) {
    println!(" * ID:      {}", feed.id);
    println!(" * Created: {}", feed.created_at.to_rfc3339());
    println!(" * Updated: {}", feed.updated_at.to_rfc3339());
    println!(" * Name:    {}", feed.name);
    println!(" * URL:     {}", feed.url);
    println!(" * User:    {}", user.name);
}

fn print_post(post: &Post) {
    let published = post
        .published_at
        .map(|at| at.format("%a %b %e %Y").to_string())
        .unwrap_or_else(|| "unknown date".to_string());
    println!();
    println!("{} from {}", published, post.url);
    println!("--- {} ---", post.title);
    if !post.description.is_empty() {
        println!("    {}", post.description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: name.to_string(),
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    mod format_users_tests {
        use super::*;

        #[test]
        fn test_marks_exactly_one_current() {
            let users = vec![user("kahya"), user("holgith"), user("ballan")];

            let lines = format_users(&users, Some("holgith"));

            assert_eq!(lines, vec!["* kahya", "* holgith (current)", "* ballan"]);
            assert_eq!(lines.iter().filter(|l| l.ends_with("(current)")).count(), 1);
        }

        #[test]
        fn test_no_current_user() {
            let users = vec![user("kahya"), user("holgith")];

            let lines = format_users(&users, None);

            assert!(lines.iter().all(|l| !l.contains("(current)")));
        }

        #[test]
        fn test_current_user_not_in_list() {
            let lines = format_users(&[user("kahya")], Some("ghost"));
            assert_eq!(lines, vec!["* kahya"]);
        }

        #[test]
        fn test_empty() {
            assert!(format_users(&[], Some("kahya")).is_empty());
        }
    }

    mod format_feeds_tests {
        use super::*;

        #[test]
        fn test_never_fetched() {
            let feeds = vec![FeedListing {
                name: "Blog".to_string(),
                url: "https://blog.example.com/rss".to_string(),
                user_name: "kahya".to_string(),
                last_fetched_at: None,
            }];

            let lines = format_feeds(&feeds);

            assert_eq!(
                lines,
                vec!["* Blog (https://blog.example.com/rss) added by kahya, last fetched never"]
            );
        }
    }

    mod agg_mode_tests {
        use super::*;
        use std::time::Duration;

        #[test]
        fn test_no_args_uses_seed_url() {
            assert_eq!(
                AggMode::from_args(&[]).unwrap(),
                AggMode::Once(SEED_FEED_URL.to_string())
            );
        }

        #[test]
        fn test_url_arg() {
            assert_eq!(
                AggMode::from_args(&args(&["https://blog.example.com/rss"])).unwrap(),
                AggMode::Once("https://blog.example.com/rss".to_string())
            );
        }

        #[test]
        fn test_interval_arg() {
            assert_eq!(
                AggMode::from_args(&args(&["1m"])).unwrap(),
                AggMode::Every(Duration::from_secs(60))
            );
        }

        #[test]
        fn test_bad_interval() {
            let result = AggMode::from_args(&args(&["soon"]));
            assert!(matches!(result, Err(CommandError::Usage(_))));
        }

        #[test]
        fn test_too_many_args() {
            let result = AggMode::from_args(&args(&["1m", "extra"]));
            assert!(matches!(result, Err(CommandError::Usage(_))));
        }
    }

    mod required_arg_tests {
        use super::*;

        #[test]
        fn test_present() {
            assert_eq!(required_arg(&args(&["kahya"]), "login", "<name>").unwrap(), "kahya");
        }

        #[test]
        fn test_missing() {
            let result = required_arg(&[], "login", "<name>");
            assert!(matches!(
                result,
                Err(CommandError::MissingArgument { command: "login", .. })
            ));
        }

        #[test]
        fn test_blank_counts_as_missing() {
            for blank in ["", "   ", "\t"] {
                let argv = args(&[blank]);
                let result = required_arg(&argv, "register", "<name>");
                assert!(matches!(
                    result,
                    Err(CommandError::MissingArgument { command: "register", .. })
                ));
            }
        }

        #[test]
        fn test_padded_name_rejected() {
            for padded in ["kahya ", " kahya", "\tkahya\n"] {
                let argv = args(&[padded]);
                let result = required_arg(&argv, "register", "<name>");
                assert!(matches!(result, Err(CommandError::Usage(_))), "{:?}", padded);
            }
        }

        #[test]
        fn test_inner_space_allowed() {
            assert_eq!(
                required_arg(&args(&["kahya of holgith"]), "login", "<name>").unwrap(),
                "kahya of holgith"
            );
        }
    }
}
