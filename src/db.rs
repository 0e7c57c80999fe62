use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqlitePool,
};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: Uuid,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A feed row joined with its owner's name.
#[derive(Debug, Clone, FromRow)]
pub struct FeedListing {
    pub name: String,
    pub url: String,
    pub user_name: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
}

impl NewUser {
    /// Fresh id, both timestamps set to now.
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewFeed {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: Uuid,
}

impl NewFeed {
    pub fn new(name: &str, url: &str, user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            name: name.to_string(),
            url: url.to_string(),
            user_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPost<'a> {
    pub feed_id: Uuid,
    pub title: &'a str,
    pub url: &'a str,
    pub description: &'a str,
    pub published_at: Option<DateTime<Utc>>,
}

/// True when `err` came from a UNIQUE constraint.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Database(db_err)) if db_err.is_unique_violation()
    )
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .foreign_keys(true)
            .create_if_missing(true);

        // Every in-memory connection is its own database, so keep exactly one alive.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BLOB PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id BLOB PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                last_fetched_at TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id BLOB PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                description TEXT NOT NULL,
                published_at TEXT,
                feed_id BLOB NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                UNIQUE(feed_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_posts_feed_published
            ON posts(feed_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, name: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn create_user(&self, user: NewUser) -> anyhow::Result<User> {
        self.create_user_then(user, |_| Ok(())).await
    }

    /// Inserts the user and runs `on_created` before committing. If the hook
    /// fails the insert is rolled back.
    pub async fn create_user_then<F>(&self, user: NewUser, on_created: F) -> anyhow::Result<User>
    where
        F: FnOnce(&User) -> anyhow::Result<()>,
    {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, created_at, updated_at, name)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(user.id)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(&user.name)
        .fetch_one(&mut *tx)
        .await?;

        on_created(&created)?;
        tx.commit().await?;

        Ok(created)
    }

    /// All users in storage order.
    pub async fn get_users(&self) -> anyhow::Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    /// Deletes every user; feeds and posts go with them.
    pub async fn reset_users(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM users")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn create_feed(&self, feed: NewFeed) -> anyhow::Result<Feed> {
        let created = sqlx::query_as::<_, Feed>(
            r#"
            INSERT INTO feeds (id, created_at, updated_at, name, url, user_id)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(feed.id)
        .bind(feed.created_at)
        .bind(feed.updated_at)
        .bind(&feed.name)
        .bind(&feed.url)
        .bind(feed.user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    pub async fn get_feeds(&self) -> anyhow::Result<Vec<FeedListing>> {
        let feeds = sqlx::query_as::<_, FeedListing>(
            r#"
            SELECT feeds.name, feeds.url, users.name AS user_name, feeds.last_fetched_at
            FROM feeds
            JOIN users ON users.id = feeds.user_id
            ORDER BY feeds.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Never-fetched feeds first, then the one fetched longest ago.
    pub async fn get_next_feed_to_fetch(&self) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            SELECT * FROM feeds
            ORDER BY last_fetched_at ASC NULLS FIRST, created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn mark_feed_fetched(&self, feed_id: Uuid, error: Option<&str>) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetched_at = ?, updated_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(error)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_post(&self, post: NewPost<'_>) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO posts (id, created_at, updated_at, title, url, description, published_at, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id, url) DO UPDATE SET
                updated_at = excluded.updated_at,
                title = excluded.title,
                description = excluded.description,
                published_at = excluded.published_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(now)
        .bind(post.title)
        .bind(post.url)
        .bind(post.description)
        .bind(post.published_at)
        .bind(post.feed_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_posts_for_user(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT posts.* FROM posts
            JOIN feeds ON feeds.id = posts.feed_id
            WHERE feeds.user_id = ?
            ORDER BY posts.published_at DESC NULLS LAST, posts.created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }
}
