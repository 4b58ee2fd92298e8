use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::Error;

/// Narrow view of an object store: fetch one object plus its custom
/// metadata. The archive consumer only ever downloads whole objects, so
/// nothing more is modeled; tests substitute a directory-backed fake.
pub trait ObjectClient: Send {
    /// Download `bucket`/`object` into the file at `dest`, returning the
    /// object's custom metadata entries.
    fn download(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<HashMap<String, String>, Error>;
}

/// Google Cloud Storage via its JSON API. Metadata comes from the object
/// resource, content from an `alt=media` read. An OAuth bearer token may be
/// supplied for private buckets.
pub struct GcsClient {
    http: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    base_url: String,
    bearer_token: Option<String>,
}

impl GcsClient {
    pub fn new(bearer_token: Option<String>) -> Self {
        Self::with_base_url("https://storage.googleapis.com", bearer_token)
    }

    pub fn with_base_url(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        GcsClient {
            http: reqwest::Client::new(),
            // Downloads run on consumer threads, outside any runtime; a
            // private current-thread runtime drives the requests.
            runtime: tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("building the download runtime"),
            base_url: base_url.into(),
            bearer_token,
        }
    }

    fn object_url(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            bucket,
            utf8_percent_encode(object, NON_ALPHANUMERIC)
        )
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}


impl ObjectClient for GcsClient {
    fn download(
        &self,
        bucket: &str,
        object: &str,
        dest: &Path,
    ) -> Result<HashMap<String, String>, Error> {
        let url = self.object_url(bucket, object);
        self.runtime.block_on(async {
            let resource: serde_json::Value = self
                .request(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let metadata = resource
                .get("metadata")
                .and_then(|metadata| metadata.as_object())
                .map(|metadata| {
                    metadata
                        .iter()
                        .filter_map(|(name, value)| {
                            Some((name.clone(), value.as_str()?.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();

            let mut response = self
                .request(&url)
                .query(&[("alt", "media")])
                .send()
                .await?
                .error_for_status()?;
            let mut file = std::fs::File::create(dest)?;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk)?;
            }
            file.flush()?;

            Ok(metadata)
        })
    }
}
