use rust_embed::RustEmbed;

/// Embedded web UI bundle (index page plus its assets)
#[derive(RustEmbed)]
#[folder = "static/"]
pub struct StaticAssets;

impl StaticAssets {
    /// Get the content type for a given file extension
    pub fn content_type(path: &str) -> &'static str {
        match path.rsplit('.').next() {
            Some("html") => "text/html; charset=utf-8",
            Some("css") => "text/css; charset=utf-8",
            Some("js") => "application/javascript; charset=utf-8",
            Some("json") => "application/json; charset=utf-8",
            Some("png") => "image/png",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("svg") => "image/svg+xml; charset=utf-8",
            Some("ico") => "image/x-icon",
            Some("woff") => "font/woff",
            Some("woff2") => "font/woff2",
            _ => "application/octet-stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_detection() {
        assert_eq!(
            StaticAssets::content_type("index.html"),
            "text/html; charset=utf-8"
        );
        assert_eq!(StaticAssets::content_type("favicon.ico"), "image/x-icon");
        assert_eq!(
            StaticAssets::content_type("unknown"),
            "application/octet-stream"
        );
    }

    #[test]
    fn index_page_is_embedded() {
        assert!(StaticAssets::get("index.html").is_some());
    }
}
