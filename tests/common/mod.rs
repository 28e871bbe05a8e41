//! Shared fixtures: in-memory parsers standing in for the network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use tokio::sync::Notify;

use feedrec::{
    CachingInfo, Database, EntryData, FeedData, FeedParser, ParseResponse, ParsedFeed, Reader,
    ReaderConfig, ReaderError,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn day(d: u32) -> Option<DateTime<Utc>> {
    Some(Utc.with_ymd_and_hms(2010, 1, d, 0, 0, 0).unwrap())
}

pub fn snapshot(url: &str, updated: Option<DateTime<Utc>>, title: &str) -> ParsedFeed {
    ParsedFeed {
        feed: FeedData {
            url: url.into(),
            updated,
            title: Some(title.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn entry(id: &str, updated: Option<DateTime<Utc>>, title: &str) -> EntryData {
    EntryData {
        id: id.into(),
        updated,
        title: Some(title.into()),
        ..Default::default()
    }
}

/// What the fake returns for one URL.
#[derive(Debug, Clone)]
pub enum Canned {
    Parsed(ParsedFeed),
    NotModified,
    Fail(String),
}

/// Parser returning canned responses and recording what it was asked.
#[derive(Default)]
pub struct FakeParser {
    responses: Mutex<HashMap<String, Canned>>,
    calls: Mutex<Vec<(String, CachingInfo)>>,
}

impl FakeParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, url: &str, response: Canned) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn set_parsed(&self, parsed: ParsedFeed) {
        let url = parsed.feed.url.clone();
        self.set(&url, Canned::Parsed(parsed));
    }

    pub fn calls(&self) -> Vec<(String, CachingInfo)> {
        self.calls.lock().unwrap().clone()
    }

    fn respond(&self, url: &str, caching: &CachingInfo) -> Result<ParseResponse, ReaderError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), caching.clone()));
        match self.responses.lock().unwrap().get(url).cloned() {
            Some(Canned::Parsed(parsed)) => Ok(ParseResponse::Parsed(parsed)),
            Some(Canned::NotModified) => Ok(ParseResponse::NotModified),
            Some(Canned::Fail(message)) => Err(ReaderError::parse_message(url, message)),
            None => Err(ReaderError::parse_message(url, "no canned response")),
        }
    }
}

impl FeedParser for FakeParser {
    fn parse<'a>(
        &'a self,
        url: &'a str,
        caching: &'a CachingInfo,
    ) -> BoxFuture<'a, Result<ParseResponse, ReaderError>> {
        Box::pin(async move { self.respond(url, caching) })
    }
}

/// Parser that signals `in_parser` and then waits on `can_return`.
#[derive(Default)]
pub struct BlockingFakeParser {
    pub inner: FakeParser,
    pub in_parser: Notify,
    pub can_return: Notify,
}

impl FeedParser for BlockingFakeParser {
    fn parse<'a>(
        &'a self,
        url: &'a str,
        caching: &'a CachingInfo,
    ) -> BoxFuture<'a, Result<ParseResponse, ReaderError>> {
        Box::pin(async move {
            self.in_parser.notify_one();
            self.can_return.notified().await;
            self.inner.respond(url, caching)
        })
    }
}

pub async fn memory_reader(parser: Arc<dyn FeedParser>) -> Reader {
    memory_reader_with(parser, ReaderConfig::default()).await
}

pub async fn memory_reader_with(parser: Arc<dyn FeedParser>, config: ReaderConfig) -> Reader {
    init_tracing();
    let db = Database::open(":memory:").await.unwrap();
    Reader::new(db, parser, config)
}
