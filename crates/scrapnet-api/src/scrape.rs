//! The scrape collaborator: fetch a page (optionally with its assets) and
//! pack it into a zip artifact.
//!
//! The rest of the node treats the result as an opaque blob; only this
//! module knows what is inside. Archives are deterministic (fixed entry
//! timestamps, stable ordering) so repeated scrapes of identical content
//! produce byte-identical blobs.

use std::io::{Cursor, Write};

use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::ScrapeConfig;
use crate::error::{ApiError, ApiResult};

/// Fetches pages and builds artifacts.
#[derive(Debug, Clone)]
pub struct Scraper {
    client: reqwest::Client,
    fetch_assets: bool,
}

impl Scraper {
    /// Build a scraper from configuration.
    pub fn new(config: &ScrapeConfig) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Internal(format!("scrape client: {e}")))?;

        Ok(Self {
            client,
            fetch_assets: config.fetch_assets,
        })
    }

    /// Fetch `url` and return the zipped artifact.
    pub async fn scrape(&self, url: &str) -> ApiResult<Vec<u8>> {
        info!(url, "Scraping");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| scrape_failed(url, &e))?;

        let html = response.text().await.map_err(|e| scrape_failed(url, &e))?;

        let mut assets = Vec::new();
        if self.fetch_assets {
            for asset_url in extract_asset_urls(url, &html) {
                match self.fetch_asset(&asset_url).await {
                    Ok(bytes) => {
                        let name = asset_file_name(&asset_url);
                        debug!(asset = %asset_url, name, "Asset downloaded");
                        assets.push((name, bytes));
                    }
                    Err(e) => {
                        warn!(asset = %asset_url, error = %e, "Asset download failed, skipping");
                    }
                }
            }
            // Stable order regardless of what the page listed first.
            assets.sort_by(|a, b| a.0.cmp(&b.0));
        }

        build_archive(&html, &assets)
    }

    async fn fetch_asset(&self, url: &Url) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn scrape_failed(url: &str, err: &reqwest::Error) -> ApiError {
    ApiError::ScrapeFailed {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// Stylesheet and script references of a page, resolved against its URL.
///
/// Parsing stays inside this function: the DOM handle is not `Send`, so it
/// must not live across an await point.
fn extract_asset_urls(base: &str, html: &str) -> Vec<Url> {
    let Ok(base) = Url::parse(base) else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut urls = Vec::new();

    for (selector, attr) in [(r#"link[rel="stylesheet"]"#, "href"), ("script[src]", "src")] {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        for element in document.select(&selector) {
            if let Some(value) = element.value().attr(attr) {
                match base.join(value) {
                    Ok(resolved) => urls.push(resolved),
                    Err(e) => debug!(reference = value, error = %e, "Unresolvable asset URL"),
                }
            }
        }
    }

    urls
}

fn asset_file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("asset")
        .to_string()
}

/// Pack `index.html` and the assets into a deflate zip.
fn build_archive(html: &str, assets: &[(String, Vec<u8>)]) -> ApiResult<Vec<u8>> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    writer
        .start_file("index.html", options)
        .map_err(|e| ApiError::Internal(format!("archive: {e}")))?;
    writer.write_all(html.as_bytes())?;

    for (name, bytes) in assets {
        writer
            .start_file(name, options)
            .map_err(|e| ApiError::Internal(format!("archive: {e}")))?;
        writer.write_all(bytes)?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| ApiError::Internal(format!("archive: {e}")))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::ZipArchive;

    const PAGE: &str = r#"<html><head>
        <link rel="stylesheet" href="/css/site.css">
        <link rel="icon" href="/favicon.ico">
        <script src="app.js"></script>
        </head><body><p>hello</p></body></html>"#;

    #[test]
    fn archive_contains_index_html() {
        let bytes = build_archive("<html></html>", &[]).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entry = archive.by_name("index.html").unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
        assert_eq!(content, "<html></html>");
    }

    #[test]
    fn archives_are_byte_identical_for_identical_input() {
        let assets = vec![("app.js".to_string(), b"console.log(1)".to_vec())];
        let first = build_archive(PAGE, &assets).unwrap();
        let second = build_archive(PAGE, &assets).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn extracts_stylesheets_and_scripts_only() {
        let urls = extract_asset_urls("http://example.com/page/", PAGE);
        let rendered: Vec<String> = urls.iter().map(Url::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "http://example.com/css/site.css".to_string(),
                "http://example.com/page/app.js".to_string(),
            ]
        );
    }

    #[test]
    fn unparsable_base_yields_no_assets() {
        assert!(extract_asset_urls("not a url", PAGE).is_empty());
    }

    #[test]
    fn asset_names_come_from_the_last_path_segment() {
        let url = Url::parse("http://example.com/static/js/app.js").unwrap();
        assert_eq!(asset_file_name(&url), "app.js");
        let bare = Url::parse("http://example.com/").unwrap();
        assert_eq!(asset_file_name(&bare), "asset");
    }
}
