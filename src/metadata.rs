//! Now-playing metadata resolution.
//!
//! Turns a service's metadata configuration into a DLS text line and an
//! artwork URL. Four source modes: STREAM (the audio encoder's own metadata
//! side-channel file), FILE (http or local text), JSON and XML (remote
//! documents with configurable keys). Everything here is best-effort —
//! fetch and parse failures resolve to empty values and a log line, never
//! an error, because this runs inside a loop that must keep ticking.

use std::path::Path;
use std::time::Duration;

use crate::logging::LogSink;
use crate::model::{MetadataMode, Service};

pub const FETCH_TIMEOUT: Duration = Duration::from_millis(2500);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub dls: String,
    pub sls_url: String,
}

/// Fetch a URL as text; any failure (status, transport, timeout) is "".
pub async fn fetch_text(client: &reqwest::Client, url: &str) -> String {
    let resp = match client.get(url).timeout(FETCH_TIMEOUT).send().await {
        Ok(r) => r,
        Err(_) => return String::new(),
    };
    if !resp.status().is_success() {
        return String::new();
    }
    resp.text().await.unwrap_or_default()
}

/// Download an image to `dest`; true only when the file was fully written.
pub async fn download_image(client: &reqwest::Client, url: &str, dest: &Path) -> bool {
    let resp = match client.get(url).timeout(DOWNLOAD_TIMEOUT).send().await {
        Ok(r) => r,
        Err(_) => return false,
    };
    if !resp.status().is_success() {
        return false;
    }
    let Ok(bytes) = resp.bytes().await else { return false };
    tokio::fs::write(dest, &bytes).await.is_ok()
}

/// `<tag>value</tag>` extraction, case-insensitive, tolerating an optional
/// CDATA wrapper. Good enough for the now-playing feeds stations actually
/// publish; not an XML parser.
pub fn extract_xml_value(xml: &str, key: &str) -> String {
    if xml.is_empty() || key.is_empty() {
        return String::new();
    }
    let escaped = regex::escape(key);
    let pattern = format!(r"(?i)<{escaped}>(?:<!\[CDATA\[)?([^<]*?)(?:\]\]>)?</{escaped}>");
    let Ok(re) = regex::Regex::new(&pattern) else {
        return String::new();
    };
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// File extension for a downloaded cover, inferred from the URL
/// (query string tolerated), defaulting to jpg.
pub fn artwork_ext(url: &str) -> &'static str {
    let Ok(re) = regex::Regex::new(r"(?i)\.(jpe?g|png|webp)(\?.*)?$") else {
        return "jpg";
    };
    match re
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .as_deref()
    {
        Some("jpeg") => "jpeg",
        Some("jpg") => "jpg",
        Some("png") => "png",
        Some("webp") => "webp",
        _ => "jpg",
    }
}

fn json_field(data: &serde_json::Value, key: &str) -> String {
    match &data[key] {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn join_artist_title(artist: &str, title: &str) -> String {
    [artist, title]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" - ")
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").trim().to_string()
}

/// Resolve the service's current DLS text and artwork URL.
///
/// `mta_path` is the encoder's metadata side-channel file (STREAM mode).
/// The explicit `slsUrl` override always wins over mode-derived artwork;
/// the default DLS applies whenever a mode resolves no text and defaults
/// are allowed.
pub async fn resolve(
    client: &reqwest::Client,
    svc: &Service,
    mta_path: &Path,
    sink: &LogSink,
) -> Resolved {
    let meta = &svc.metadata;
    let mut dls = String::new();
    let mut sls_url = String::new();

    match meta.mode {
        MetadataMode::None => return Resolved::default(),
        MetadataMode::Stream => {
            if let Ok(text) = std::fs::read_to_string(mta_path) {
                dls = first_line(&text);
            }
        }
        MetadataMode::File => {
            let src = meta.url.as_deref().unwrap_or("");
            if src.starts_with("http://") || src.starts_with("https://") {
                dls = fetch_text(client, src).await.trim().to_string();
            } else if !src.is_empty() {
                if let Ok(text) = std::fs::read_to_string(src) {
                    dls = first_line(&text);
                }
            }
        }
        MetadataMode::Json => {
            let url = meta.url.as_deref().unwrap_or("");
            if !url.is_empty() {
                let text = fetch_text(client, url).await;
                if !text.is_empty() {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(data) => {
                            let artist = json_field(&data, &meta.artist_key);
                            let title = json_field(&data, &meta.title_key);
                            dls = join_artist_title(&artist, &title);
                            sls_url = json_field(&data, &meta.sls_key);
                        }
                        Err(e) => {
                            sink.line("metadata", &format!("json parse failed ({}): {e}", svc.id));
                        }
                    }
                }
            }
        }
        MetadataMode::Xml => {
            let url = meta.url.as_deref().unwrap_or("");
            if !url.is_empty() {
                let xml = fetch_text(client, url).await;
                if !xml.is_empty() {
                    let artist = extract_xml_value(&xml, &meta.artist_key);
                    let title = extract_xml_value(&xml, &meta.title_key);
                    dls = join_artist_title(&artist, &title);
                    sls_url = extract_xml_value(&xml, &meta.sls_key);
                }
            }
        }
    }

    if dls.is_empty() && meta.default_dls_allowed {
        dls = meta.default_dls.clone();
    }

    if let Some(override_url) = meta.sls_url.as_deref() {
        let trimmed = override_url.trim();
        if !trimmed.is_empty() {
            sls_url = trimmed.to_string();
        }
    }

    Resolved { dls, sls_url }
}

/// When nothing resolves an artwork URL, reuse the station logo staged in
/// the slide directory (`logo.png/.jpg/.webp`) as the cover image. Failures
/// are swallowed: a missing logo just means no slide update.
pub fn copy_default_logo(slide_dir: &Path) {
    for name in ["logo.png", "logo.jpg", "logo.webp"] {
        let src = slide_dir.join(name);
        if src.exists() {
            let ext = src
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("jpg")
                .to_string();
            let _ = std::fs::copy(&src, slide_dir.join(format!("cover.{ext}")));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetadataMode, NewService, Service};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture() -> (tempfile::TempDir, Arc<LogSink>, reqwest::Client) {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(LogSink::new(dir.path().join("engine.log")).unwrap());
        (dir, sink, reqwest::Client::new())
    }

    fn svc_with_mode(mode: MetadataMode, url: Option<String>) -> Service {
        let mut svc = Service::from_spec(&NewService::default(), "fip".into(), 9001, 1);
        svc.metadata.mode = mode;
        svc.metadata.url = url;
        svc
    }

    #[tokio::test]
    async fn json_mode_joins_artist_and_title() {
        let (dir, sink, client) = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/now"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "artist": "A", "title": "B", "cover": "http://img.example/c.png"
            })))
            .mount(&server)
            .await;

        let svc = svc_with_mode(MetadataMode::Json, Some(format!("{}/now", server.uri())));
        let resolved = resolve(&client, &svc, &dir.path().join("FIP.mta"), &sink).await;
        assert_eq!(resolved.dls, "A - B");
        assert_eq!(resolved.sls_url, "http://img.example/c.png");
    }

    #[tokio::test]
    async fn json_mode_tolerates_missing_artist() {
        let (dir, sink, client) = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "title": "Solo" })),
            )
            .mount(&server)
            .await;

        let svc = svc_with_mode(MetadataMode::Json, Some(server.uri()));
        let resolved = resolve(&client, &svc, &dir.path().join("x.mta"), &sink).await;
        assert_eq!(resolved.dls, "Solo");
    }

    #[tokio::test]
    async fn malformed_json_is_logged_and_falls_back() {
        let (dir, sink, client) = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{ nope"))
            .mount(&server)
            .await;

        let mut svc = svc_with_mode(MetadataMode::Json, Some(server.uri()));
        svc.metadata.default_dls = "WELCOME".into();
        let resolved = resolve(&client, &svc, &dir.path().join("x.mta"), &sink).await;
        assert_eq!(resolved.dls, "WELCOME");
        assert!(sink.read_all().contains("json parse failed (fip)"));
    }

    #[tokio::test]
    async fn xml_mode_extracts_tags_including_cdata() {
        let (dir, sink, client) = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<now><Artist><![CDATA[Miles Davis]]></Artist><title>So What</title>\
                 <cover>http://img.example/kob.jpg</cover></now>",
            ))
            .mount(&server)
            .await;

        let svc = svc_with_mode(MetadataMode::Xml, Some(server.uri()));
        let resolved = resolve(&client, &svc, &dir.path().join("x.mta"), &sink).await;
        assert_eq!(resolved.dls, "Miles Davis - So What");
        assert_eq!(resolved.sls_url, "http://img.example/kob.jpg");
    }

    #[test]
    fn xml_extraction_is_case_insensitive() {
        let xml = "<NOW><ARTIST>A</ARTIST></NOW>";
        assert_eq!(extract_xml_value(xml, "artist"), "A");
        assert_eq!(extract_xml_value(xml, "missing"), "");
        assert_eq!(extract_xml_value("", "artist"), "");
    }

    #[tokio::test]
    async fn file_mode_missing_local_path_uses_default() {
        let (dir, sink, client) = fixture();
        let mut svc =
            svc_with_mode(MetadataMode::File, Some("/definitely/not/here.txt".into()));
        svc.metadata.default_dls = "WELCOME".into();
        let resolved = resolve(&client, &svc, &dir.path().join("x.mta"), &sink).await;
        assert_eq!(resolved.dls, "WELCOME");

        // With defaults disallowed the text stays empty.
        svc.metadata.default_dls_allowed = false;
        let resolved = resolve(&client, &svc, &dir.path().join("x.mta"), &sink).await;
        assert_eq!(resolved.dls, "");
    }

    #[tokio::test]
    async fn file_mode_reads_first_line_of_local_file() {
        let (dir, sink, client) = fixture();
        let src = dir.path().join("now.txt");
        std::fs::write(&src, "Kraftwerk - Autobahn\nsecond line\n").unwrap();
        let svc = svc_with_mode(MetadataMode::File, Some(src.display().to_string()));
        let resolved = resolve(&client, &svc, &dir.path().join("x.mta"), &sink).await;
        assert_eq!(resolved.dls, "Kraftwerk - Autobahn");
    }

    #[tokio::test]
    async fn stream_mode_reads_encoder_side_channel() {
        let (dir, sink, client) = fixture();
        let mta = dir.path().join("FIP.mta");
        std::fs::write(&mta, "Now Playing Line\nrest\n").unwrap();
        let svc = svc_with_mode(MetadataMode::Stream, None);
        let resolved = resolve(&client, &svc, &mta, &sink).await;
        assert_eq!(resolved.dls, "Now Playing Line");
    }

    #[tokio::test]
    async fn explicit_override_wins_over_mode_artwork() {
        let (dir, sink, client) = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "artist": "A", "title": "B", "cover": "http://img.example/from-feed.jpg"
            })))
            .mount(&server)
            .await;

        let mut svc = svc_with_mode(MetadataMode::Json, Some(server.uri()));
        svc.metadata.sls_url = Some("http://img.example/station-logo.png".into());
        let resolved = resolve(&client, &svc, &dir.path().join("x.mta"), &sink).await;
        assert_eq!(resolved.sls_url, "http://img.example/station-logo.png");
    }

    #[test]
    fn artwork_extension_inference() {
        assert_eq!(artwork_ext("http://x/cover.png"), "png");
        assert_eq!(artwork_ext("http://x/cover.JPG?size=600"), "jpg");
        assert_eq!(artwork_ext("http://x/cover.jpeg"), "jpeg");
        assert_eq!(artwork_ext("http://x/cover.webp"), "webp");
        assert_eq!(artwork_ext("http://x/cover"), "jpg");
    }

    #[tokio::test]
    async fn download_image_writes_file_only_on_success() {
        let (dir, _sink, client) = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegbytes".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ok_dest = dir.path().join("cover.jpg");
        assert!(download_image(&client, &format!("{}/ok.jpg", server.uri()), &ok_dest).await);
        assert_eq!(std::fs::read(&ok_dest).unwrap(), b"jpegbytes");

        let bad_dest = dir.path().join("cover2.jpg");
        assert!(!download_image(&client, &format!("{}/gone.jpg", server.uri()), &bad_dest).await);
        assert!(!bad_dest.exists());
    }

    #[test]
    fn default_logo_copy_prefers_png_and_swallows_absence() {
        let dir = tempfile::tempdir().unwrap();
        // No logo at all: nothing happens.
        copy_default_logo(dir.path());
        assert!(!dir.path().join("cover.png").exists());

        std::fs::write(dir.path().join("logo.webp"), b"w").unwrap();
        std::fs::write(dir.path().join("logo.png"), b"p").unwrap();
        copy_default_logo(dir.path());
        assert_eq!(std::fs::read(dir.path().join("cover.png")).unwrap(), b"p");
        assert!(!dir.path().join("cover.webp").exists());
    }
}
