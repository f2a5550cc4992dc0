//! RSS 2.0 / Atom parsing into [`FeedItem`] windows.

use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::ingest::types::{FeedItem, FeedParser, ParseError, ParsedFeed};
use crate::ingest::{digest_id, normalize_text};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    author: Option<String>,
    description: Option<String>,
}

/// Element whose attributes we ignore and whose text we keep.
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    title: Option<Text>,
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: Option<String>,
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<Text>,
    content: Option<Text>,
    author: Option<AtomAuthor>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    name: Option<String>,
}

/// Parse RFC 2822 (RSS) or RFC 3339 (Atom) timestamps.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    match OffsetDateTime::parse(ts, &Rfc2822).or_else(|_| OffsetDateTime::parse(ts, &Rfc3339)) {
        Ok(parsed) => DateTime::<Utc>::from_timestamp(parsed.unix_timestamp(), 0),
        // obsolete zone names such as "EST"
        Err(_) => DateTime::parse_from_rfc2822(ts)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
    }
}

/// Feed parser for RSS 2.0 and Atom 1.0 documents.
#[derive(Debug, Clone, Default)]
pub struct XmlFeedParser;

impl XmlFeedParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_rss(xml: &str) -> Result<ParsedFeed, ParseError> {
        let rss: Rss = from_str(xml).map_err(|e| ParseError::Xml(e.to_string()))?;
        let items = rss
            .channel
            .items
            .into_iter()
            .map(|it| {
                let title = normalize_text(it.title.as_deref().unwrap_or_default());
                let link = it.link.unwrap_or_default().trim().to_string();
                let raw_id = it
                    .guid
                    .map(|g| g.value.trim().to_string())
                    .filter(|g| !g.is_empty())
                    .unwrap_or_else(|| digest_id(&title, &link));
                let description = it.description.map(|d| normalize_text(&d));
                FeedItem {
                    published: it.pub_date.as_deref().and_then(parse_timestamp),
                    author: it.author.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
                    text: description.clone(),
                    description,
                    title,
                    link,
                    raw_id,
                }
            })
            .collect();
        Ok(ParsedFeed {
            title: rss.channel.title.map(|t| normalize_text(&t)),
            items,
        })
    }

    fn parse_atom(xml: &str) -> Result<ParsedFeed, ParseError> {
        let feed: AtomFeed = from_str(xml).map_err(|e| ParseError::Xml(e.to_string()))?;
        let items = feed
            .entries
            .into_iter()
            .map(|e| {
                let title = normalize_text(e.title.as_ref().map(|t| t.value.as_str()).unwrap_or_default());
                let link = alternate_link(&e.links).unwrap_or_default();
                let raw_id = e
                    .id
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| digest_id(&title, &link));
                let published = e
                    .published
                    .as_deref()
                    .or(e.updated.as_deref())
                    .and_then(parse_timestamp);
                let description = e.summary.map(|s| normalize_text(&s.value));
                let text = e.content.map(|c| normalize_text(&c.value)).or_else(|| description.clone());
                FeedItem {
                    title,
                    link,
                    raw_id,
                    published,
                    author: e.author.and_then(|a| a.name).map(|n| n.trim().to_string()),
                    description,
                    text,
                }
            })
            .collect();
        Ok(ParsedFeed {
            title: feed.title.map(|t| normalize_text(&t.value)),
            items,
        })
    }
}

/// `rel="alternate"` (or rel-less) link, falling back to the first one.
fn alternate_link(links: &[AtomLink]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .and_then(|l| l.href.clone())
        .map(|h| h.trim().to_string())
}

impl FeedParser for XmlFeedParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
        let t0 = std::time::Instant::now();
        let raw = String::from_utf8_lossy(bytes);
        let xml = scrub_html_entities_for_xml(&raw);

        let parsed = match root_element(&xml) {
            Ok(Some(root)) if root == "rss" => Self::parse_rss(&xml),
            Ok(Some(root)) if root == "feed" => Self::parse_atom(&xml),
            Ok(_) => Err(ParseError::UnknownFormat),
            Err(e) => Err(e),
        };

        histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        parsed
    }
}

/// Local name of the document's first element, lowercased.
fn root_element(xml: &str) -> Result<Option<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                return Ok(Some(name));
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(ParseError::Xml(e.to_string())),
        }
    }
}

/// HTML entities are not defined in XML; feeds use them anyway.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
