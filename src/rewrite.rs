use regex::{Captures, Regex};
use tracing::debug;

use crate::config::ImagesConfig;

/// Rewrites image URLs on hotlink-protected hosts to go through the backend's
/// image proxy, so previews and saved drafts keep working.
#[derive(Debug, Clone)]
pub struct ImageProxy {
    pattern: Option<Regex>,
    proxy_path: String,
}

impl ImageProxy {
    pub fn new(config: &ImagesConfig) -> Self {
        let hosts: Vec<String> = config
            .hotlink_hosts
            .iter()
            .filter(|h| !h.is_empty())
            .map(|h| regex::escape(h))
            .collect();

        // URL runs until a quote, whitespace or markup delimiter.
        let pattern = if hosts.is_empty() {
            None
        } else {
            Regex::new(&format!(r#"https?://(?:{})/[^"'\s<>)]+"#, hosts.join("|"))).ok()
        };

        Self {
            pattern,
            proxy_path: config.proxy_path.clone(),
        }
    }

    /// Returns the rewritten content and how many URLs were replaced.
    ///
    /// Already-proxied URLs are percent-encoded, so a second pass is a no-op.
    pub fn rewrite(&self, content: &str) -> (String, usize) {
        let Some(pattern) = &self.pattern else {
            return (content.to_string(), 0);
        };

        let mut count = 0;
        let rewritten = pattern.replace_all(content, |caps: &Captures| {
            count += 1;
            format!("{}?url={}", self.proxy_path, urlencoding::encode(&caps[0]))
        });

        if count > 0 {
            debug!(count, "rewrote hotlink-protected image URLs");
        }
        (rewritten.into_owned(), count)
    }
}
