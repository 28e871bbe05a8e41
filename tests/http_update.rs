//! End-to-end updates through the HTTP parser against a mock server.

mod common;

use std::sync::Arc;

use common::init_tracing;
use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedrec::{
    Database, EntryFilter, FeedUpdate, FetchConfig, HttpFeedParser, Reader, ReaderConfig,
    ReaderError,
};

const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Mock Feed</title>
    <link>https://example.com/</link>
    <lastBuildDate>Sat, 02 Jan 2010 00:00:00 GMT</lastBuildDate>
    <item>
        <guid>one</guid>
        <title>First</title>
        <pubDate>Fri, 01 Jan 2010 00:00:00 GMT</pubDate>
    </item>
    <item>
        <guid>two</guid>
        <title>Second</title>
        <pubDate>Sat, 02 Jan 2010 00:00:00 GMT</pubDate>
    </item>
</channel></rss>"#;

async fn http_reader() -> Reader {
    init_tracing();
    let config = ReaderConfig {
        fetch: FetchConfig {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let parser = HttpFeedParser::new(&config.fetch).unwrap();
    let db = Database::open(":memory:").await.unwrap();
    Reader::new(db, Arc::new(parser), config)
}

#[tokio::test]
async fn test_update_then_conditional_not_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(RSS)
                .insert_header("ETag", "\"v1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let reader = http_reader().await;
    let url = format!("{}/feed", server.uri());
    reader.add_feed(&url).await.unwrap();

    match reader.update_feed(&url).await.unwrap() {
        FeedUpdate::Updated(outcome) => {
            assert!(outcome.feed_updated);
            assert_eq!(outcome.new_entries, vec!["one".to_string(), "two".to_string()]);
        }
        other => panic!("Expected Updated, got {:?}", other),
    }

    let feed = reader.get_feed(&url).await.unwrap().unwrap();
    assert_eq!(feed.title.as_deref(), Some("Mock Feed"));

    let ids: Vec<String> = reader
        .get_entries(EntryFilter::all())
        .map_ok(|(_, e)| e.id)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(ids, vec!["two".to_string(), "one".to_string()]);

    // The stored ETag goes out with the next request.
    assert_eq!(
        reader.update_feed(&url).await.unwrap(),
        FeedUpdate::NotModified
    );
}

#[tokio::test]
async fn test_http_failure_is_recorded_per_feed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let reader = http_reader().await;
    let good = format!("{}/good", server.uri());
    let gone = format!("{}/gone", server.uri());
    reader.add_feed(&good).await.unwrap();
    reader.add_feed(&gone).await.unwrap();

    let results = reader.update_feeds().await.unwrap();
    assert!(matches!(results[&good], Ok(FeedUpdate::Updated(_))));
    match &results[&gone] {
        Err(err @ ReaderError::Parse { .. }) => {
            let text = err.to_string();
            assert!(text.starts_with("error while updating feed: "), "{}", text);
            assert!(text.contains("410"), "{}", text);
        }
        other => panic!("Expected parse error, got {:?}", other),
    }
}
