//! Archive fetching from local paths or HTTP(S) URLs.
//!
//! The archive is handed out as a stream; nothing here buffers the whole body.
//! Remote sources get exactly one GET and no retry.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ToolboxError;

/// Connect timeout for remote toolbox downloads
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Where a toolbox archive comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Local(PathBuf),
    Remote(String),
}

impl ArchiveSource {
    /// Parse a locator: `file://` URLs and bare paths are local, http(s) is remote
    pub fn parse(locator: &str) -> Self {
        if let Some(path) = locator.strip_prefix("file://") {
            ArchiveSource::Local(PathBuf::from(path))
        } else if locator.starts_with("http://") || locator.starts_with("https://") {
            ArchiveSource::Remote(locator.to_string())
        } else {
            ArchiveSource::Local(PathBuf::from(locator))
        }
    }
}

/// Opens archive byte streams
pub struct ArchiveFetcher {
    locator: String,
    source: ArchiveSource,
}

impl ArchiveFetcher {
    pub fn new(locator: impl Into<String>) -> Self {
        let locator = locator.into();
        let source = ArchiveSource::parse(&locator);
        Self { locator, source }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn source(&self) -> &ArchiveSource {
        &self.source
    }

    /// Open the archive as a readable stream.
    ///
    /// Blocking; call from a blocking context.
    pub fn open(&self) -> Result<Box<dyn Read + Send>, ToolboxError> {
        match &self.source {
            ArchiveSource::Local(path) => {
                debug!("Opening local toolbox {}", path.display());
                let file = File::open(path).map_err(|e| self.unavailable(format!(
                    "failed to open local file: {}",
                    e
                )))?;
                Ok(Box::new(file))
            }
            ArchiveSource::Remote(url) => {
                info!("Downloading toolbox from {}", url);
                let client = reqwest::blocking::Client::builder()
                    .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                    // The body is streamed by the extractor; no overall deadline.
                    .timeout(None)
                    .user_agent(format!("gradientctl/{}", env!("CARGO_PKG_VERSION")))
                    .build()
                    .map_err(|e| self.unavailable(format!("failed to build HTTP client: {}", e)))?;

                let response = client
                    .get(url)
                    .send()
                    .map_err(|e| self.unavailable(format!("failed to download file: {}", e)))?;

                if !response.status().is_success() {
                    return Err(self.unavailable(format!("bad status: {}", response.status())));
                }

                Ok(Box::new(response))
            }
        }
    }

    fn unavailable(&self, reason: String) -> ToolboxError {
        ToolboxError::SourceUnavailable {
            locator: self.locator.clone(),
            reason,
        }
    }
}
