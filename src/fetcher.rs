use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::parser;
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

pub const USER_AGENT: &str = concat!("gator/", env!("CARGO_PKG_VERSION"));

/// Per-request deadline used by the CLI.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// Longest named reference in HTML5 is 32 characters plus `&` and `;`.
const MAX_ENTITY_LEN: usize = 34;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection refused, DNS, TLS, body read failures
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body is not a well-formed feed
    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Everything except a parse failure happened on the wire.
    pub fn is_network(&self) -> bool {
        !matches!(self, FetchError::Parse(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedDocument {
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: Option<DateTime<Utc>>,
}

impl fmt::Display for FeedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = &self.channel;
        writeln!(f, "Title:       {}", channel.title)?;
        writeln!(f, "Link:        {}", channel.link)?;
        writeln!(f, "Description: {}", channel.description)?;
        writeln!(f, "Items:       {}", channel.items.len())?;
        for item in &channel.items {
            writeln!(f)?;
            writeln!(f, "* {}", item.title)?;
            if !item.link.is_empty() {
                writeln!(f, "  {}", item.link)?;
            }
            if let Some(published) = item.pub_date {
                writeln!(f, "  published {}", published.to_rfc3339())?;
            }
            if !item.description.is_empty() {
                writeln!(f, "  {}", item.description)?;
            }
        }
        Ok(())
    }
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }

    /// Single GET, no retries. The whole exchange must finish within `deadline`.
    pub async fn fetch(&self, url: &str, deadline: Duration) -> Result<FeedDocument, FetchError> {
        info!("Fetching feed: {}", url);

        let bytes = tokio::time::timeout(deadline, self.download(url))
            .await
            .map_err(|_| FetchError::Timeout(deadline))??;

        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        parse_document(&bytes)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Turns a raw feed body into a document with every text field unescaped.
pub fn parse_document(bytes: &[u8]) -> Result<FeedDocument, FetchError> {
    ensure_well_formed(bytes)?;

    let parsed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let items = parsed
        .entries
        .into_iter()
        .map(|entry| {
            let description = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();

            FeedItem {
                title: entry
                    .title
                    .map(|t| unescape_html(&t.content))
                    .unwrap_or_default(),
                link: entry
                    .links
                    .first()
                    .map(|l| l.href.clone())
                    .unwrap_or_default(),
                description: unescape_html(&description),
                pub_date: entry.published.or(entry.updated),
            }
        })
        .collect();

    Ok(FeedDocument {
        channel: Channel {
            title: parsed
                .title
                .map(|t| unescape_html(&t.content))
                .unwrap_or_default(),
            link: parsed
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default(),
            description: parsed
                .description
                .map(|d| unescape_html(&d.content))
                .unwrap_or_default(),
            items,
        },
    })
}

/// Rejects bodies with mismatched or unclosed tags so a truncated document is
/// never mapped into a partial feed.
fn ensure_well_formed(bytes: &[u8]) -> Result<(), FetchError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut depth: usize = 0;
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) => {
                depth += 1;
                saw_root = true;
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Empty(_)) => saw_root = true,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(FetchError::Parse(format!(
                    "malformed XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
        buf.clear();
    }

    if depth != 0 {
        return Err(FetchError::Parse(format!(
            "unexpected end of document with {} unclosed element(s)",
            depth
        )));
    }
    if !saw_root {
        return Err(FetchError::Parse("document has no root element".to_string()));
    }
    Ok(())
}

/// Resolves HTML named and numeric character references. Anything that is not
/// a valid reference (a bare `&`, an unknown name) is kept as written.
pub fn unescape_html(raw: &str) -> String {
    if let Ok(text) = unescape_with(raw, resolve_html5_entity) {
        return text.into_owned();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];

        let decoded = candidate
            .find(';')
            .filter(|&end| end <= MAX_ENTITY_LEN)
            .filter(|&end| !candidate[1..end].contains(|c: char| c.is_whitespace() || c == '&'))
            .and_then(|end| {
                unescape_with(&candidate[..=end], resolve_html5_entity)
                    .ok()
                    .map(|text| (text.into_owned(), end))
            });

        match decoded {
            Some((text, end)) => {
                out.push_str(&text);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <rss version="2.0">
            <channel>
                <title>Lane&apos;s Blog &amp;amp; Notes</title>
                <link>https://blog.example.com</link>
                <description>Thoughts on &amp;lt;code&amp;gt;</description>
                <item>
                    <title>Rust &amp; You</title>
                    <link>https://blog.example.com/rust</link>
                    <description>It&amp;#39;s here</description>
                    <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                </item>
                <item>
                    <title>Second Post</title>
                    <link>https://blog.example.com/second</link>
                </item>
            </channel>
        </rss>
    "#;

    mod unescape_html_tests {
        use super::*;

        #[test]
        fn test_plain_text_unchanged() {
            assert_eq!(unescape_html("Hello World"), "Hello World");
        }

        #[test]
        fn test_named_entities() {
            assert_eq!(unescape_html("a &amp; b &lt;c&gt;"), "a & b <c>");
        }

        #[test]
        fn test_html_only_entities() {
            assert_eq!(unescape_html("caf&eacute;&nbsp;ok"), "caf\u{e9}\u{a0}ok");
        }

        #[test]
        fn test_numeric_references() {
            assert_eq!(unescape_html("It&#39;s &#x41;"), "It's A");
        }

        #[test]
        fn test_bare_ampersand_kept() {
            assert_eq!(unescape_html("Tom & Jerry"), "Tom & Jerry");
        }

        #[test]
        fn test_bare_ampersand_next_to_entity() {
            assert_eq!(unescape_html("AT&T &amp; co"), "AT&T & co");
        }

        #[test]
        fn test_unknown_entity_kept() {
            assert_eq!(unescape_html("&bogus; &amp;"), "&bogus; &");
        }

        #[test]
        fn test_empty() {
            assert_eq!(unescape_html(""), "");
        }
    }

    mod parse_document_tests {
        use super::*;

        #[test]
        fn test_channel_fields_unescaped() {
            let doc = parse_document(SAMPLE_RSS.as_bytes()).unwrap();

            assert_eq!(doc.channel.title, "Lane's Blog & Notes");
            assert_eq!(doc.channel.description, "Thoughts on <code>");
            assert!(doc.channel.link.starts_with("https://blog.example.com"));
        }

        #[test]
        fn test_item_fields_unescaped() {
            let doc = parse_document(SAMPLE_RSS.as_bytes()).unwrap();

            assert_eq!(doc.channel.items.len(), 2);
            let first = &doc.channel.items[0];
            assert_eq!(first.title, "Rust & You");
            assert!(!first.title.contains("&amp;"));
            assert_eq!(first.description, "It's here");
            assert_eq!(first.link, "https://blog.example.com/rust");
            assert!(first.pub_date.is_some());
        }

        #[test]
        fn test_item_without_description_or_date() {
            let doc = parse_document(SAMPLE_RSS.as_bytes()).unwrap();

            let second = &doc.channel.items[1];
            assert_eq!(second.title, "Second Post");
            assert_eq!(second.description, "");
            assert!(second.pub_date.is_none());
        }

        #[test]
        fn test_empty_channel() {
            let xml = r#"<rss version="2.0"><channel><title>Empty</title></channel></rss>"#;
            let doc = parse_document(xml.as_bytes()).unwrap();
            assert_eq!(doc.channel.title, "Empty");
            assert!(doc.channel.items.is_empty());
        }

        #[test]
        fn test_truncated_document_is_parse_error() {
            let xml = r#"<rss version="2.0"><channel><title>Cut off</title><item><title>x</title>"#;
            let result = parse_document(xml.as_bytes());
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }

        #[test]
        fn test_mismatched_tags_is_parse_error() {
            let xml = r#"<rss><channel><title>Broken</wrong></channel></rss>"#;
            let result = parse_document(xml.as_bytes());
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }

        #[test]
        fn test_not_xml_is_parse_error() {
            let result = parse_document(b"this is not xml at all");
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }

        #[test]
        fn test_html_page_is_parse_error() {
            let html = "<html><body><p>Not a feed</p></body></html>";
            let result = parse_document(html.as_bytes());
            assert!(matches!(result, Err(FetchError::Parse(_))));
        }

        #[test]
        fn test_parse_error_is_not_network() {
            let err = parse_document(b"").unwrap_err();
            assert!(!err.is_network());
        }
    }

    mod display_tests {
        use super::*;

        #[test]
        fn test_display_lists_items() {
            let doc = parse_document(SAMPLE_RSS.as_bytes()).unwrap();
            let rendered = doc.to_string();

            assert!(rendered.contains("Title:       Lane's Blog & Notes"));
            assert!(rendered.contains("Items:       2"));
            assert!(rendered.contains("* Rust & You"));
            assert!(rendered.contains("* Second Post"));
        }
    }

    mod fetch_tests {
        use super::*;
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn test_fetch_success_sends_user_agent() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/index.xml"))
                .and(header("user-agent", USER_AGENT))
                .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_RSS))
                .expect(1)
                .mount(&server)
                .await;

            let fetcher = Fetcher::new().unwrap();
            let doc = fetcher
                .fetch(&format!("{}/index.xml", server.uri()), DEFAULT_FETCH_TIMEOUT)
                .await
                .unwrap();

            assert_eq!(doc.channel.items[0].title, "Rust & You");
        }

        #[tokio::test]
        async fn test_fetch_http_error_status() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;

            let fetcher = Fetcher::new().unwrap();
            let err = fetcher
                .fetch(&server.uri(), DEFAULT_FETCH_TIMEOUT)
                .await
                .unwrap_err();

            assert!(matches!(err, FetchError::HttpStatus(404)));
            assert!(err.is_network());
        }

        #[tokio::test]
        async fn test_fetch_deadline_exceeded() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(SAMPLE_RSS)
                        .set_delay(Duration::from_secs(5)),
                )
                .mount(&server)
                .await;

            let fetcher = Fetcher::new().unwrap();
            let err = fetcher
                .fetch(&server.uri(), Duration::from_millis(100))
                .await
                .unwrap_err();

            assert!(matches!(err, FetchError::Timeout(_)));
            assert!(err.is_network());
        }

        #[tokio::test]
        async fn test_fetch_connection_refused() {
            let fetcher = Fetcher::new().unwrap();
            let err = fetcher
                .fetch("http://127.0.0.1:1/feed.xml", DEFAULT_FETCH_TIMEOUT)
                .await
                .unwrap_err();

            assert!(matches!(err, FetchError::Network(_)));
        }

        #[tokio::test]
        async fn test_fetch_malformed_body() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_string("<rss><channel><title>oops"),
                )
                .mount(&server)
                .await;

            let fetcher = Fetcher::new().unwrap();
            let err = fetcher
                .fetch(&server.uri(), DEFAULT_FETCH_TIMEOUT)
                .await
                .unwrap_err();

            assert!(matches!(err, FetchError::Parse(_)));
        }
    }
}
