// src/sources/rss.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::item::RawItem;
use crate::sources::FeedReader;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let unix = OffsetDateTime::parse(ts, &Rfc2822)
        .ok()?
        .to_offset(UtcOffset::UTC)
        .unix_timestamp();
    Utc.timestamp_opt(unix, 0).single()
}

/// RSS 2.0 reader over HTTP. Parse failures and non-success statuses map
/// to `SourceFetch`; the poller owns retries.
pub struct RssFeedReader {
    client: reqwest::Client,
}

impl RssFeedReader {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { client }
    }

    pub(crate) fn parse_items(xml: &str) -> Result<Vec<RawItem>> {
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean)
            .map_err(|e| PipelineError::SourceFetch(format!("rss parse: {e}")))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            out.push(RawItem {
                title: it.title,
                body: it.description.unwrap_or_default(),
                link: it.link,
                published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
                guid: it.guid,
            });
        }
        debug!(items = out.len(), "rss feed parsed");
        Ok(out)
    }
}

#[async_trait]
impl FeedReader for RssFeedReader {
    async fn fetch(&self, uri: &str) -> Result<Vec<RawItem>> {
        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| PipelineError::SourceFetch(format!("http get {uri}: {e}")))?;
        if !resp.status().is_success() {
            return Err(PipelineError::SourceFetch(format!(
                "http {} for {uri}",
                resp.status()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| PipelineError::SourceFetch(format!("http body {uri}: {e}")))?;
        Self::parse_items(&body)
    }
}

/// Feeds in the wild embed bare HTML entities that choke the XML parser.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example Wire</title>
    <item>
      <title>Newest story</title>
      <link>https://wire.test/3</link>
      <guid>wire-3</guid>
      <pubDate>Fri, 05 Sep 2025 14:00:00 GMT</pubDate>
      <description>Third &ndash; latest.</description>
    </item>
    <item>
      <title>Older story</title>
      <link>https://wire.test/2</link>
      <guid>wire-2</guid>
      <pubDate>Fri, 05 Sep 2025 10:00:00 GMT</pubDate>
      <description>Second.</description>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_items_in_document_order() {
        let items = RssFeedReader::parse_items(SAMPLE).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].guid.as_deref(), Some("wire-3"));
        assert_eq!(items[0].title.as_deref(), Some("Newest story"));
        assert_eq!(items[1].link.as_deref(), Some("https://wire.test/2"));
        assert!(items[0].published_at.unwrap() > items[1].published_at.unwrap());
    }

    #[test]
    fn bad_xml_is_source_fetch_error() {
        let err = RssFeedReader::parse_items("<rss><chan").err().unwrap();
        assert!(matches!(err, PipelineError::SourceFetch(_)));
    }
}
