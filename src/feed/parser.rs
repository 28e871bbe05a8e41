use chrono::{DateTime, Datelike, Utc};
use feed_rs::model;
use feed_rs::parser::{self, ParseFeedError};
use sha2::{Digest, Sha256};

use crate::storage::{BozoException, Content, Enclosure, EntryData, FeedData, ParsedFeed};

/// Parse an RSS, Atom or JSON Feed document into a snapshot.
///
/// A strict parse is tried first. If it fails and the bytes are not valid
/// UTF-8, the document is decoded lossily and parsed again; a success on
/// that path is flagged `bozo` with [`BozoException::EncodingOverride`].
pub fn parse_document(url: &str, bytes: &[u8]) -> Result<ParsedFeed, ParseFeedError> {
    let (feed, bozo_exception) = match parser::parse(bytes) {
        Ok(feed) => (feed, None),
        Err(strict_err) => {
            if std::str::from_utf8(bytes).is_ok() {
                return Err(strict_err);
            }
            let lossy = String::from_utf8_lossy(bytes);
            let feed = parser::parse(lossy.as_bytes()).map_err(|_| strict_err)?;
            tracing::debug!(feed = %url, "Recovered feed after lossy decoding");
            (
                feed,
                Some(BozoException::EncodingOverride(
                    "document is not valid UTF-8; decoded lossily".to_string(),
                )),
            )
        }
    };

    let version = format!("{:?}", feed.feed_type).to_lowercase();
    let feed_data = FeedData {
        url: url.to_string(),
        updated: storable(feed.updated.or(feed.published)),
        title: feed.title.map(|t| t.content),
        link: pick_link(&feed.links),
        author: feed.authors.first().map(|p| p.name.clone()),
    };
    let entries = feed.entries.into_iter().map(convert_entry).collect();

    Ok(ParsedFeed {
        feed: feed_data,
        entries,
        bozo: bozo_exception.is_some(),
        bozo_exception,
        version: Some(version),
        ..Default::default()
    })
}

/// The alternate link if there is one, else the first link.
fn pick_link(links: &[model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

fn convert_entry(entry: model::Entry) -> EntryData {
    let link = pick_link(&entry.links);
    let updated = storable(entry.updated.or(entry.published));
    let title = entry.title.map(|t| t.content);

    let mut content = Vec::new();
    if let Some(body) = entry.content.as_ref().and_then(|c| c.body.clone()) {
        content.push(Content {
            value: body,
            content_type: entry.content.as_ref().map(|c| c.content_type.to_string()),
            language: None,
        });
    }

    let mut enclosures: Vec<Enclosure> = entry
        .links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure"))
        .map(|l| Enclosure {
            href: l.href.clone(),
            content_type: l.media_type.clone(),
            length: l.length,
        })
        .collect();
    for object in &entry.media {
        for media in &object.content {
            if let Some(url) = &media.url {
                enclosures.push(Enclosure {
                    href: url.as_str().to_string(),
                    content_type: media.content_type.as_ref().map(|m| m.to_string()),
                    length: media.size,
                });
            }
        }
    }

    let existing_id = if entry.id.is_empty() {
        None
    } else {
        Some(entry.id.as_str())
    };
    let id = generate_id(existing_id, link.as_deref(), title.as_deref().unwrap_or(""), updated);

    EntryData {
        id,
        updated,
        title,
        link,
        author: entry.authors.first().map(|p| p.name.clone()),
        published: storable(entry.published),
        summary: entry.summary.map(|s| s.content),
        content,
        enclosures,
    }
}

/// Drop timestamps whose year does not fit in four digits; the store keeps
/// timestamps as fixed-width text and sorts them as such.
fn storable(dt: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    dt.filter(|d| (0..=9999).contains(&d.year()))
}

/// Use the document's id, or derive a stable one from link, title and date.
fn generate_id(
    existing: Option<&str>,
    link: Option<&str>,
    title: &str,
    updated: Option<DateTime<Utc>>,
) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        link.unwrap_or(""),
        title,
        updated.map(|u| u.timestamp().to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
