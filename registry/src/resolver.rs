//! Registry side of the OCI distribution protocol.
//!
//! [`Resolver`] is the seam between the client and the network;
//! [`HttpResolver`] speaks the distribution HTTP API.

use std::sync::Arc;

use async_trait::async_trait;
use chartstash_core::config::StashConfig;
use chartstash_core::error::{RegistryErrorKind, Result, StashError};
use dashmap::DashMap;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};

use crate::credentials::{CredentialStore, RegistryAuth};
use crate::digest::Digest;
use crate::manifest::{
    Descriptor, ACCEPTED_MANIFEST_MEDIA_TYPES, MAX_MANIFEST_SIZE, OCI_MANIFEST_MEDIA_TYPE,
};
use crate::reference::Reference;
use crate::transport::build_http_client;

/// Longest error body quoted back in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Fetches and publishes manifests and blobs on a registry.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Raw manifest bytes for the reference's tag or digest, with the
    /// media type the registry reported.
    async fn fetch_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String)>;

    async fn fetch_blob(&self, reference: &Reference, digest: &Digest) -> Result<Vec<u8>>;

    async fn blob_exists(&self, reference: &Reference, digest: &Digest) -> Result<bool>;

    /// Upload a blob unless the registry already has it.
    async fn push_blob(
        &self,
        reference: &Reference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor>;

    /// Publish manifest bytes under the reference's tag or digest.
    async fn push_manifest(
        &self,
        reference: &Reference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor>;
}

/// Where request credentials come from.
enum AuthSource {
    Fixed(RegistryAuth),
    Store {
        store: CredentialStore,
        resolved: DashMap<String, RegistryAuth>,
    },
}

/// [`Resolver`] over the distribution HTTP API.
pub struct HttpResolver {
    client: Client,
    plain_http: bool,
    max_blob_size: u64,
    auth: AuthSource,
}

impl HttpResolver {
    /// Build a resolver from configuration, reading credentials from the
    /// configured credentials file.
    pub fn new(config: &StashConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            plain_http: config.plain_http,
            max_blob_size: config.max_blob_size,
            auth: AuthSource::Store {
                store: CredentialStore::new(config.credentials_file.clone()),
                resolved: DashMap::new(),
            },
        })
    }

    /// Use `auth` for every registry instead of the credentials file.
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = AuthSource::Fixed(auth);
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn into_shared(self) -> Arc<dyn Resolver> {
        Arc::new(self)
    }

    fn base_url(&self, reference: &Reference) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!(
            "{}://{}/v2/{}",
            scheme,
            reference.registry(),
            reference.repository_path()
        )
    }

    fn manifest_url(&self, reference: &Reference) -> String {
        format!("{}/manifests/{}", self.base_url(reference), reference.target())
    }

    fn blob_url(&self, reference: &Reference, digest: &Digest) -> String {
        format!("{}/blobs/{}", self.base_url(reference), digest)
    }

    fn upload_url(&self, reference: &Reference) -> String {
        format!("{}/blobs/uploads/", self.base_url(reference))
    }

    fn authorize(&self, reference: &Reference, request: RequestBuilder) -> Result<RequestBuilder> {
        let registry = reference.registry();
        let auth = match &self.auth {
            AuthSource::Fixed(auth) => auth.clone(),
            AuthSource::Store { store, resolved } => {
                let cached = resolved.get(&registry).map(|auth| auth.clone());
                match cached {
                    Some(auth) => auth,
                    None => {
                        let auth = RegistryAuth::resolve(store, &registry)?;
                        resolved.insert(registry, auth.clone());
                        auth
                    }
                }
            }
        };

        Ok(match auth {
            RegistryAuth::Anonymous => request,
            RegistryAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            RegistryAuth::Bearer(token) => request.bearer_auth(token),
        })
    }

    async fn send(&self, reference: &Reference, request: RequestBuilder) -> Result<Response> {
        self.authorize(reference, request)?
            .send()
            .await
            .map_err(|e| send_error(reference, e))
    }

    /// Read a body, failing once it exceeds `limit` bytes.
    async fn read_limited(
        &self,
        reference: &Reference,
        mut response: Response,
        limit: u64,
        what: &str,
    ) -> Result<Vec<u8>> {
        let too_large = || {
            StashError::registry(
                reference.registry(),
                RegistryErrorKind::Protocol,
                format!("{} exceeds the {} byte limit", what, limit),
            )
        };

        if response.content_length().is_some_and(|len| len > limit) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| send_error(reference, e))?
        {
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn fetch_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String)> {
        let url = self.manifest_url(reference);
        tracing::debug!(reference = %reference, url = %url, "Fetching manifest");

        let request = self
            .client
            .get(&url)
            .header(ACCEPT, ACCEPTED_MANIFEST_MEDIA_TYPES.join(", "));
        let response = check_status(reference, self.send(reference, request).await?, "manifest").await?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string());
        let body = self
            .read_limited(reference, response, MAX_MANIFEST_SIZE as u64, "manifest")
            .await?;

        Ok((body, media_type))
    }

    async fn fetch_blob(&self, reference: &Reference, digest: &Digest) -> Result<Vec<u8>> {
        let url = self.blob_url(reference, digest);
        tracing::debug!(reference = %reference, digest = %digest, "Fetching blob");

        let request = self.client.get(&url);
        let response = check_status(reference, self.send(reference, request).await?, "blob").await?;
        self.read_limited(reference, response, self.max_blob_size, "blob")
            .await
    }

    async fn blob_exists(&self, reference: &Reference, digest: &Digest) -> Result<bool> {
        let request = self.client.head(self.blob_url(reference, digest));
        let response = self.send(reference, request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => check_status(reference, response, "blob").await.map(|_| false),
        }
    }

    async fn push_blob(
        &self,
        reference: &Reference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let descriptor = Descriptor::for_bytes(media_type, data);

        if self.blob_exists(reference, &descriptor.digest).await? {
            tracing::debug!(reference = %reference, digest = %descriptor.digest, "Blob already on registry, skipping upload");
            return Ok(descriptor);
        }

        let upload_url = self.upload_url(reference);
        let request = self.client.post(&upload_url).header(CONTENT_LENGTH, "0");
        let response = check_status(reference, self.send(reference, request).await?, "upload").await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                StashError::registry(
                    reference.registry(),
                    RegistryErrorKind::Protocol,
                    "upload response has no Location header",
                )
            })?;
        let mut put_url = Url::parse(&upload_url)
            .and_then(|base| base.join(location))
            .map_err(|e| {
                StashError::registry(
                    reference.registry(),
                    RegistryErrorKind::Protocol,
                    format!("invalid upload location '{}': {}", location, e),
                )
            })?;
        put_url
            .query_pairs_mut()
            .append_pair("digest", &descriptor.digest.to_string());

        let request = self
            .client
            .put(put_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec());
        check_status(reference, self.send(reference, request).await?, "upload").await?;

        tracing::info!(reference = %reference, digest = %descriptor.digest, size = descriptor.size, "Uploaded blob");
        Ok(descriptor)
    }

    async fn push_manifest(
        &self,
        reference: &Reference,
        data: &[u8],
        media_type: &str,
    ) -> Result<Descriptor> {
        let descriptor = Descriptor::for_bytes(media_type, data);
        let request = self
            .client
            .put(self.manifest_url(reference))
            .header(CONTENT_TYPE, media_type)
            .body(data.to_vec());
        check_status(reference, self.send(reference, request).await?, "manifest").await?;

        tracing::info!(reference = %reference, digest = %descriptor.digest, "Pushed manifest");
        Ok(descriptor)
    }
}

fn send_error(reference: &Reference, e: reqwest::Error) -> StashError {
    let kind = if e.is_timeout() {
        RegistryErrorKind::Timeout
    } else {
        RegistryErrorKind::Network
    };
    StashError::registry(reference.registry(), kind, e.to_string())
}

/// Map a non-success response to a registry error.
async fn check_status(reference: &Reference, response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let kind = match status {
        StatusCode::NOT_FOUND => RegistryErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryErrorKind::Auth,
        _ => RegistryErrorKind::Protocol,
    };
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }

    Err(StashError::registry(
        reference.registry(),
        kind,
        format!("{} {} for {}: {}", what, status, reference, body.trim()),
    ))
}
