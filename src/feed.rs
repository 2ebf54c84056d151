/**
 * MIT License
 *
 * podscan - Copyright (c) 2025 podscan developers
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use chrono::{DateTime, Utc};
use rfc822_sanitizer::parse_from_rfc2822_with_fallback;
use rss::{Channel, Item};
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("failed to fetch feed {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("failed to read feed body: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse feed: {0}")]
    Parse(#[from] rss::Error),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub image_url: Option<String>,
}

/// One feed entry as the poller sees it, before any database state exists.
/// Entries with an empty GUID are still emitted; the poller rejects them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CandidateEpisode {
    pub guid: String,
    pub title: Option<String>,
    pub audio_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedFeed {
    pub meta: FeedMeta,
    pub episodes: Vec<CandidateEpisode>,
}

/// Given a URL, this pulls the data about a podcast and its episodes from an
/// RSS feed. There are existing specifications for podcast RSS feeds that a
/// feed should adhere to, but this does try to make some attempt to account
/// for feeds that are not valid according to them.
pub fn fetch_feed(url: &str) -> Result<ParsedFeed, FeedParseError> {
    let agent = ureq::builder()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(Duration::from_secs(20))
        .build();

    let response = agent.get(url).call().map_err(|err| FeedParseError::Fetch {
        url: url.to_string(),
        source: Box::new(err),
    })?;

    let mut body = Vec::new();
    response.into_reader().read_to_end(&mut body)?;

    let channel = Channel::read_from(&body[..])?;
    Ok(parse_channel(&channel))
}

pub fn parse_channel(channel: &Channel) -> ParsedFeed {
    let title = Some(channel.title().to_string()).filter(|t| !t.is_empty());
    let image_url = channel
        .image()
        .map(|img| img.url().to_string())
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|itunes| itunes.image().map(str::to_string))
        })
        .filter(|u| !u.is_empty());

    let episodes = channel.items().iter().map(parse_item).collect();

    ParsedFeed {
        meta: FeedMeta { title, image_url },
        episodes,
    }
}

/// GUID fallback order: item guid, then item link, then empty string.
/// Audio URL: the enclosure, when its media type has an `audio/` prefix.
fn parse_item(item: &Item) -> CandidateEpisode {
    let guid = item
        .guid()
        .map(|guid| guid.value().to_string())
        .or_else(|| item.link().map(str::to_string))
        .unwrap_or_default();

    let title = item.title().map(str::to_string).filter(|t| !t.is_empty());

    let audio_url = item
        .enclosure()
        .filter(|enc| enc.mime_type().starts_with("audio/"))
        .map(|enc| enc.url().to_string());

    let published_at = item.pub_date().and_then(|raw| {
        parse_from_rfc2822_with_fallback(raw)
            .map(|date| date.with_timezone(&Utc))
            .ok()
    });

    CandidateEpisode {
        guid,
        title,
        audio_url,
        published_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn channel_from(xml: &str) -> Channel {
        Channel::read_from(xml.as_bytes()).unwrap()
    }

    const FEED_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Signals Weekly</title>
    <image><url>https://cdn.example.com/cover.png</url><title>x</title><link>https://example.com</link></image>
    <item>
      <title>Episode One</title>
      <guid>ep-001</guid>
      <pubDate>Mon, 06 Jan 2025 10:30:00 GMT</pubDate>
      <enclosure url="https://cdn.example.com/ep-001.mp3" length="123" type="audio/mpeg"/>
    </item>
    <item>
      <title>Episode Two</title>
      <link>https://example.com/ep-002</link>
      <enclosure url="https://cdn.example.com/ep-002.mp3" length="456" type="audio/mpeg"/>
    </item>
    <item>
      <title>Video Special</title>
      <guid>ep-003</guid>
      <enclosure url="https://cdn.example.com/ep-003.mp4" length="789" type="video/mp4"/>
    </item>
    <item>
      <title>No Media</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_feed_meta() {
        let parsed = parse_channel(&channel_from(FEED_XML));
        assert_eq!(parsed.meta.title.as_deref(), Some("Signals Weekly"));
        assert_eq!(
            parsed.meta.image_url.as_deref(),
            Some("https://cdn.example.com/cover.png")
        );
    }

    #[test]
    fn guid_falls_back_to_link_then_empty() {
        let parsed = parse_channel(&channel_from(FEED_XML));
        assert_eq!(parsed.episodes[0].guid, "ep-001");
        assert_eq!(parsed.episodes[1].guid, "https://example.com/ep-002");
        assert_eq!(parsed.episodes[3].guid, "");
    }

    #[test]
    fn audio_url_requires_audio_media_type() {
        let parsed = parse_channel(&channel_from(FEED_XML));
        assert_eq!(
            parsed.episodes[0].audio_url.as_deref(),
            Some("https://cdn.example.com/ep-001.mp3")
        );
        // video enclosure is not usable audio
        assert_eq!(parsed.episodes[2].audio_url, None);
        assert_eq!(parsed.episodes[3].audio_url, None);
    }

    #[test]
    fn pub_date_is_parsed_into_utc() {
        let parsed = parse_channel(&channel_from(FEED_XML));
        let expected = Utc.with_ymd_and_hms(2025, 1, 6, 10, 30, 0).unwrap();
        assert_eq!(parsed.episodes[0].published_at, Some(expected));
        assert_eq!(parsed.episodes[1].published_at, None);
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        let err = Channel::read_from(&b"this is not xml at all"[..]);
        assert!(err.is_err());
    }
}
