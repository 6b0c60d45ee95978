// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Source loading
//!
//! Fetches the raw bytes behind a resolved url, retrying transient transport
//! failures with exponential backoff. A load either returns every byte of
//! the asset or fails; there are no partial results.

mod fetch;
pub mod mime;

pub use fetch::{FetchError, FetchErrorKind, Fetched, Fetcher, FileFetcher, MemoryFetcher};

use crate::config::LoaderConfig;
use crate::error::{ImportError, Result};
use crate::handler::Encoding;
use crate::native::NativeCheck;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;

/// A fully loaded asset
#[derive(Debug, Clone)]
pub struct SourceAsset {
    /// Resolved url
    pub url: Url,
    /// Raw, undecoded bytes
    pub bytes: Bytes,
    /// Transport mime type, or the extension guess
    pub mime_type: String,
    /// Requested, transport or inferred encoding
    pub encoding: Encoding,
    /// Hash of `bytes`
    pub fingerprint: String,
    /// Whether the host handles the asserted type for this mime natively
    pub native_handler_available: bool,
}

/// Content fingerprint of `bytes`
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("sha256-{}", hex::encode(Sha256::digest(bytes)))
}

/// Loads [`SourceAsset`]s through a [`Fetcher`]
pub struct SourceLoader {
    fetcher: Arc<dyn Fetcher>,
    native: Arc<NativeCheck>,
    config: LoaderConfig,
}

impl SourceLoader {
    /// Create a source loader
    pub fn new(fetcher: Arc<dyn Fetcher>, native: Arc<NativeCheck>, config: &LoaderConfig) -> Self {
        Self {
            fetcher,
            native,
            config: config.clone(),
        }
    }

    /// Load the asset at `url`.
    ///
    /// `requested_encoding` wins over the transport charset, which wins over
    /// the mime-based guess.
    #[instrument(skip(self, url), fields(url = %url))]
    pub async fn load(
        &self,
        url: &Url,
        asserted_type: &str,
        requested_encoding: Option<&str>,
    ) -> Result<SourceAsset> {
        let mut attempt: u32 = 0;
        let fetched = loop {
            match self.fetcher.fetch(url).await {
                Ok(fetched) => break fetched,
                Err(err) if err.is_transient() && attempt < self.config.load_retries => {
                    let delay = self.config.backoff_for(attempt);
                    attempt += 1;
                    warn!(
                        "Transient failure loading {} (attempt {}/{}): {}, retrying in {:?}",
                        url,
                        attempt,
                        self.config.load_retries + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(ImportError::Load {
                        url: url.to_string(),
                        asserted_type: asserted_type.to_string(),
                        handler: None,
                        attempts: attempt + 1,
                        reason: err.to_string(),
                    });
                }
            }
        };

        let (mime_type, charset) = match fetched.content_type.as_deref() {
            Some(ct) => {
                let (mime, charset) = mime::parse_content_type(ct);
                if mime.is_empty() {
                    (mime::mime_from_extension(url).to_string(), charset)
                } else {
                    (mime, charset)
                }
            }
            None => (mime::mime_from_extension(url).to_string(), None),
        };

        let encoding = match (requested_encoding, charset) {
            (Some(requested), _) if requested.eq_ignore_ascii_case("blob") => Encoding::Blob,
            (Some(requested), _) => Encoding::text(requested),
            (None, Some(charset)) => Encoding::text(&charset),
            (None, None) if mime::is_textual(&mime_type) => Encoding::text("utf-8"),
            (None, None) => Encoding::Blob,
        };

        let native_handler_available = self.native.available(asserted_type, &mime_type);
        let fingerprint = fingerprint(&fetched.bytes);

        debug!(
            bytes = fetched.bytes.len(),
            mime_type = %mime_type,
            encoding = %encoding,
            fingerprint = %fingerprint,
            "Loaded source"
        );

        Ok(SourceAsset {
            url: url.clone(),
            bytes: fetched.bytes,
            mime_type,
            encoding,
            fingerprint,
            native_handler_available,
        })
    }
}
