use crate::constants::{DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_INDEX, OCI_MANIFEST};
use crate::error::{LayerstackError, Result};
use crate::oci::digest::Digest;
use crate::oci::manifest::{sniff_media_type, ManifestKind};
use crate::oci::reference::Reference;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Manifest bytes exactly as stored in a registry
#[derive(Debug, Clone, PartialEq)]
pub struct RawManifest {
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub digest: Digest,
}

impl RawManifest {
    pub fn new(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let digest = Digest::sha256(&bytes);
        Self {
            media_type: media_type.into(),
            bytes,
            digest,
        }
    }

    pub fn kind(&self) -> ManifestKind {
        ManifestKind::of(&self.media_type)
    }

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Payload that can be written under a tag as-is
pub trait Taggable {
    fn raw_manifest(&self) -> &[u8];
}

/// Descriptor fields of a payload, known without re-reading it
pub trait Describable {
    fn digest(&self) -> &Digest;
    fn media_type(&self) -> &str;
    fn size(&self) -> u64;
}

pub trait ManifestPayload: Taggable + Describable + Send + Sync {}

impl<T: Taggable + Describable + Send + Sync> ManifestPayload for T {}

impl Taggable for RawManifest {
    fn raw_manifest(&self) -> &[u8] {
        &self.bytes
    }
}

impl Describable for RawManifest {
    fn digest(&self) -> &Digest {
        &self.digest
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Registry operations the engine needs. Repositories are taken from the
/// given references; tags and digests only matter for manifests.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_manifest(&self, reference: &Reference) -> Result<RawManifest>;

    async fn get_blob(&self, repo: &Reference, digest: &Digest) -> Result<Vec<u8>>;

    async fn blob_exists(&self, repo: &Reference, digest: &Digest) -> Result<bool>;

    async fn put_blob(&self, repo: &Reference, digest: &Digest, data: Vec<u8>) -> Result<()>;

    /// Cross-repository mount. Returns false when the registry did not mount.
    async fn mount_blob(&self, _from: &Reference, _to: &Reference, _digest: &Digest) -> Result<bool> {
        Ok(false)
    }

    /// Write a manifest under the target's tag, or under the payload digest when untagged
    async fn put_manifest(&self, target: &Reference, manifest: &dyn ManifestPayload) -> Result<()>;
}

/// Authentication credentials for a container registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
}

impl RegistryAuth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Reads `LAYERSTACK_REGISTRY_TOKEN`, then `LAYERSTACK_REGISTRY_USERNAME` and
    /// `LAYERSTACK_REGISTRY_PASSWORD`. Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        if let Ok(token) = std::env::var("LAYERSTACK_REGISTRY_TOKEN") {
            if !token.is_empty() {
                return Self::Bearer(token);
            }
        }
        match (
            std::env::var("LAYERSTACK_REGISTRY_USERNAME"),
            std::env::var("LAYERSTACK_REGISTRY_PASSWORD"),
        ) {
            (Ok(u), Ok(p)) if !u.is_empty() => Self::basic(u, p),
            _ => Self::Anonymous,
        }
    }
}

/// Auth and TLS posture shared by every registry call of a build
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub auth: RegistryAuth,
    /// Plain http, for local test registries
    pub insecure: bool,
}

/// Distribution API client on top of async reqwest
pub struct HttpRegistry {
    client: Client,
    config: RegistryConfig,
    /// Bearer tokens from challenge responses, by scope
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("layerstack/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            config,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(&self, repo: &Reference) -> String {
        let host = match repo.registry() {
            "docker.io" | "index.docker.io" => "registry-1.docker.io",
            other => other,
        };
        let scheme = if self.config.insecure { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, host, repo.repository())
    }

    fn scope(repo: &Reference, push: bool) -> String {
        let actions = if push { "pull,push" } else { "pull" };
        format!("repository:{}:{}", repo.repository(), actions)
    }

    async fn authorize(&self, rb: RequestBuilder, scope: &str) -> RequestBuilder {
        if let Some(token) = self.tokens.lock().await.get(scope) {
            return rb.bearer_auth(token);
        }
        match &self.config.auth {
            RegistryAuth::Anonymous => rb,
            RegistryAuth::Basic { username, password } => rb.basic_auth(username, Some(password)),
            RegistryAuth::Bearer(token) => rb.bearer_auth(token),
        }
    }

    /// Sends a request, answering one bearer challenge if the registry asks for it
    async fn send<F>(&self, scope: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let resp = self.authorize(build(&self.client), scope).await.send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(challenge) = challenge.filter(|c| c.starts_with("Bearer ")) else {
            return Ok(resp);
        };
        let token = self.fetch_token(&challenge, scope).await?;
        self.tokens.lock().await.insert(scope.to_string(), token.clone());
        Ok(build(&self.client).bearer_auth(token).send().await?)
    }

    async fn fetch_token(&self, challenge: &str, scope: &str) -> Result<String> {
        let params = parse_challenge(challenge);
        let realm = params
            .get("realm")
            .ok_or_else(|| LayerstackError::registry("auth", "bearer challenge without realm"))?;
        let mut url = Url::parse(realm).map_err(|e| LayerstackError::registry("auth", e))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            query.append_pair("scope", params.get("scope").map(String::as_str).unwrap_or(scope));
        }
        let mut rb = self.client.get(url);
        if let RegistryAuth::Basic { username, password } = &self.config.auth {
            rb = rb.basic_auth(username, Some(password));
        }
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            return Err(LayerstackError::registry(
                "auth",
                format!("token request failed: {}", resp.status()),
            ));
        }
        let body: serde_json::Value = resp.json().await?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| LayerstackError::registry("auth", "token response without token"))
    }

    async fn finish_upload(&self, repo: &Reference, location: &str, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let base = Url::parse(&self.base_url(repo)).map_err(|e| LayerstackError::registry("upload", e))?;
        let mut url = base
            .join(location)
            .map_err(|e| LayerstackError::registry("upload", e))?;
        url.query_pairs_mut().append_pair("digest", &digest.to_string());

        let scope = Self::scope(repo, true);
        let resp = self
            .send(&scope, |c| {
                c.put(url.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(LayerstackError::registry(
                "upload",
                format!("blob {}: {}", status_hash(digest), resp.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get_manifest(&self, reference: &Reference) -> Result<RawManifest> {
        let identifier = match reference.digest() {
            Some(d) => d.to_string(),
            None => reference.identifier(),
        };
        let url = format!("{}/manifests/{}", self.base_url(reference), identifier);
        let accept = [OCI_INDEX, OCI_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_MANIFEST].join(", ");
        tracing::debug!(reference = %reference, "fetching manifest");

        let scope = Self::scope(reference, false);
        let resp = self
            .send(&scope, |c| c.get(&url).header(ACCEPT, accept.as_str()))
            .await?;
        if !resp.status().is_success() {
            return Err(LayerstackError::registry(
                "pull",
                format!("manifest {}: {}", reference, resp.status()),
            ));
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = resp.bytes().await?.to_vec();
        let media_type = match content_type {
            Some(ct) if ct.starts_with("application/vnd.") => ct,
            _ => sniff_media_type(&bytes)?,
        };
        let raw = RawManifest::new(media_type, bytes);
        if let Some(expected) = reference.digest() {
            if &raw.digest != expected {
                return Err(LayerstackError::registry(
                    "pull",
                    format!("manifest digest {} does not match {}", raw.digest, expected),
                ));
            }
        }
        Ok(raw)
    }

    async fn get_blob(&self, repo: &Reference, digest: &Digest) -> Result<Vec<u8>> {
        tracing::debug!(digest = %status_hash(digest), "downloading blob");
        let url = format!("{}/blobs/{}", self.base_url(repo), digest);
        let resp = self.send(&Self::scope(repo, false), |c| c.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(LayerstackError::registry(
                "pull",
                format!("blob {}: {}", digest, resp.status()),
            ));
        }
        let bytes = resp.bytes().await?.to_vec();
        if Digest::sha256(&bytes) != *digest {
            return Err(LayerstackError::registry(
                "pull",
                format!("blob content does not match {}", digest),
            ));
        }
        Ok(bytes)
    }

    async fn blob_exists(&self, repo: &Reference, digest: &Digest) -> Result<bool> {
        let url = format!("{}/blobs/{}", self.base_url(repo), digest);
        let resp = self.send(&Self::scope(repo, false), |c| c.head(&url)).await?;
        Ok(resp.status().is_success())
    }

    async fn put_blob(&self, repo: &Reference, digest: &Digest, data: Vec<u8>) -> Result<()> {
        if self.blob_exists(repo, digest).await? {
            tracing::debug!(digest = %status_hash(digest), "skip blob, already exists");
            return Ok(());
        }
        tracing::debug!(digest = %status_hash(digest), bytes = data.len(), "uploading blob");

        let url = format!("{}/blobs/uploads/", self.base_url(repo));
        let resp = self.send(&Self::scope(repo, true), |c| c.post(&url)).await?;
        if !resp.status().is_success() {
            return Err(LayerstackError::registry(
                "upload",
                format!("initiate blob upload: {}", resp.status()),
            ));
        }
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| LayerstackError::registry("upload", "no Location header in upload initiation"))?
            .to_string();
        self.finish_upload(repo, &location, digest, data).await
    }

    async fn mount_blob(&self, from: &Reference, to: &Reference, digest: &Digest) -> Result<bool> {
        if from.registry() != to.registry() {
            return Ok(false);
        }
        let mut url = Url::parse(&format!("{}/blobs/uploads/", self.base_url(to)))
            .map_err(|e| LayerstackError::registry("mount", e))?;
        url.query_pairs_mut()
            .append_pair("mount", &digest.to_string())
            .append_pair("from", from.repository());
        let resp = self
            .send(&Self::scope(to, true), |c| c.post(url.clone()))
            .await?;
        Ok(resp.status() == StatusCode::CREATED)
    }

    async fn put_manifest(&self, target: &Reference, manifest: &dyn ManifestPayload) -> Result<()> {
        let identifier = match target.tag() {
            Some(t) => t.to_string(),
            None => manifest.digest().to_string(),
        };
        tracing::debug!(digest = %status_hash(manifest.digest()), target = %target, "uploading manifest");
        let url = format!("{}/manifests/{}", self.base_url(target), identifier);
        let body = manifest.raw_manifest().to_vec();
        let media_type = manifest.media_type().to_string();
        let resp = self
            .send(&Self::scope(target, true), |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, media_type.as_str())
                    .body(body.clone())
            })
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(LayerstackError::registry(
                "push",
                format!("manifest {}: {} {}", target, status, detail),
            ));
        }
        Ok(())
    }
}

/// `Bearer realm="...",service="...",scope="..."` into key/value pairs
fn parse_challenge(header: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let rest = header.trim_start_matches("Bearer ").trim();
    let mut remaining = rest;
    while !remaining.is_empty() {
        let Some((key, after)) = remaining.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let (value, next) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        params.insert(key, value.to_string());
        remaining = next.trim_start_matches(',').trim();
    }
    params
}

pub(crate) fn status_hash(digest: &Digest) -> &str {
    digest.short()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:org/app:pull""#,
        );
        assert_eq!(params["realm"], "https://auth.example.com/token");
        assert_eq!(params["service"], "registry.example.com");
        assert_eq!(params["scope"], "repository:org/app:pull");
    }

    #[test]
    fn test_base_url_maps_docker_hub() {
        let registry = HttpRegistry::new(RegistryConfig::default()).unwrap();
        let r = Reference::parse("nginx:1").unwrap();
        assert_eq!(
            registry.base_url(&r),
            "https://registry-1.docker.io/v2/library/nginx"
        );
    }

    #[test]
    fn test_insecure_uses_http() {
        let registry = HttpRegistry::new(RegistryConfig {
            insecure: true,
            ..Default::default()
        })
        .unwrap();
        let r = Reference::parse("localhost:5000/app:dev").unwrap();
        assert_eq!(registry.base_url(&r), "http://localhost:5000/v2/app");
    }

    #[test]
    fn test_raw_manifest_describes_itself() {
        let raw = RawManifest::new(OCI_MANIFEST, b"{}".to_vec());
        assert_eq!(raw.size(), 2);
        assert_eq!(raw.digest(), &Digest::sha256(b"{}"));
        assert_eq!(raw.kind(), ManifestKind::OciManifest);
    }
}
