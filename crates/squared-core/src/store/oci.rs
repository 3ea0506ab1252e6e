use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, LINK, LOCATION};
use serde::Deserialize;
use url::Url;

use crate::env::StoreConfig;
use crate::error::StoreError;

use super::manifest::{self, Descriptor, ImageManifest, MEDIA_TYPE_IMAGE_MANIFEST};
use super::{
    ArtifactStore, Digest, LATEST, PulledArtifact, PushReceipt, PushRequest, Reference, RepoPath,
    VersionTag, ensure_before,
};

const CONTENT_DIGEST: &str = "docker-content-digest";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 1000;
const BODY_EXCERPT: usize = 512;

/// Blocking client for an OCI distribution registry over plain HTTP.
pub struct OciStore {
    endpoint: Url,
    client: Client,
}

impl OciStore {
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let endpoint = cfg.endpoint()?;
        let client = Client::builder()
            .timeout(cfg.timeout)
            .connect_timeout(cfg.timeout)
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url, StoreError> {
        self.endpoint
            .join(path)
            .map_err(|err| StoreError::invalid_reference(path, err.to_string()))
    }

    fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        builder.send().map_err(|err| self.unavailable(&err))
    }

    fn unavailable(&self, err: &reqwest::Error) -> StoreError {
        StoreError::Unavailable {
            registry: self.endpoint.to_string(),
            reason: err.to_string(),
        }
    }

    fn read_body(&self, response: Response) -> Result<Vec<u8>, StoreError> {
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| self.unavailable(&err))
    }

    fn blob_exists(&self, repo: &RepoPath, digest: &Digest) -> Result<bool, StoreError> {
        let url = self.url(&format!("v2/{repo}/blobs/{digest}"))?;
        let response = self.send(self.client.head(url))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(unexpected(format!("HEAD blob {repo}@{digest}"), response)),
        }
    }

    fn upload_blob(
        &self,
        repo: &RepoPath,
        digest: &Digest,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        let start = self.url(&format!("v2/{repo}/blobs/uploads/"))?;
        let response = self.send(self.client.post(start))?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(unexpected(format!("start upload to {repo}"), response));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| StoreError::Registry {
                operation: format!("start upload to {repo}"),
                status: response.status().as_u16(),
                body: "upload response has no Location header".to_string(),
            })?;
        let mut target = self
            .endpoint
            .join(location)
            .map_err(|err| StoreError::invalid_reference(location, err.to_string()))?;
        target.query_pairs_mut().append_pair("digest", digest.as_str());

        let response = self.send(
            self.client
                .put(target)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        )?;
        if !response.status().is_success() {
            return Err(unexpected(format!("upload blob {repo}@{digest}"), response));
        }
        tracing::debug!(repository = %repo, digest = %digest.short(), "blob uploaded");
        Ok(())
    }

    fn manifest_exists(&self, repo: &RepoPath, reference: &str) -> Result<bool, StoreError> {
        let url = self.url(&format!("v2/{repo}/manifests/{reference}"))?;
        let response = self.send(self.client.head(url).header(ACCEPT, MEDIA_TYPE_IMAGE_MANIFEST))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(unexpected(format!("HEAD manifest {repo}:{reference}"), response)),
        }
    }

    fn put_manifest(
        &self,
        repo: &RepoPath,
        reference: &str,
        bytes: &[u8],
    ) -> Result<Digest, StoreError> {
        let url = self.url(&format!("v2/{repo}/manifests/{reference}"))?;
        let response = self.send(
            self.client
                .put(url)
                .header(CONTENT_TYPE, MEDIA_TYPE_IMAGE_MANIFEST)
                .body(bytes.to_vec()),
        )?;
        if !response.status().is_success() {
            return Err(unexpected(format!("PUT manifest {repo}:{reference}"), response));
        }
        let computed = Digest::sha256_from_bytes(bytes);
        match header_digest(response.headers()) {
            Some(reported) if reported != computed => Err(StoreError::malformed(
                repo.as_str(),
                reference,
                format!("registry reported digest {reported}, expected {computed}"),
            )),
            _ => Ok(computed),
        }
    }

    fn get_manifest(
        &self,
        repo: &RepoPath,
        reference: &Reference,
    ) -> Result<(Digest, ImageManifest), StoreError> {
        let url = self.url(&format!("v2/{repo}/manifests/{reference}"))?;
        let response = self.send(self.client.get(url).header(ACCEPT, MEDIA_TYPE_IMAGE_MANIFEST))?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(StoreError::not_found(repo.as_str(), reference.as_str()));
            }
            _ => return Err(unexpected(format!("GET manifest {repo}:{reference}"), response)),
        }
        let bytes = self.read_body(response)?;
        let digest = Digest::sha256_from_bytes(&bytes);
        if let Reference::Digest(expected) = reference {
            if *expected != digest {
                return Err(StoreError::malformed(
                    repo.as_str(),
                    reference.as_str(),
                    format!("manifest content hashes to {digest}"),
                ));
            }
        }
        let manifest = ImageManifest::parse(repo.as_str(), reference.as_str(), &bytes)?;
        Ok((digest, manifest))
    }

    fn get_blob(
        &self,
        repo: &RepoPath,
        reference: &Reference,
        layer: &Descriptor,
    ) -> Result<Vec<u8>, StoreError> {
        let url = self.url(&format!("v2/{repo}/blobs/{}", layer.digest))?;
        let response = self.send(self.client.get(url))?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(StoreError::MissingLayer {
                    repository: repo.to_string(),
                    reference: reference.to_string(),
                    digest: layer.digest.to_string(),
                });
            }
            _ => return Err(unexpected(format!("GET blob {repo}@{}", layer.digest), response)),
        }
        let bytes = self.read_body(response)?;
        if !layer.digest.verifies(&bytes) {
            return Err(StoreError::malformed(
                repo.as_str(),
                reference.as_str(),
                format!("layer content does not match {}", layer.digest),
            ));
        }
        Ok(bytes)
    }

    /// Follow `Link: <...>; rel="next"` pagination, collecting one string
    /// list per page.
    fn paginate<F>(
        &self,
        first: Url,
        operation: &str,
        mut extract: F,
    ) -> Result<Vec<String>, StoreError>
    where
        F: FnMut(&[u8]) -> Result<Vec<String>, StoreError>,
    {
        let mut collected = Vec::new();
        let mut next = Some(first);
        let mut pages = 0;
        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                tracing::warn!(operation, pages, "pagination limit reached");
                break;
            }
            let response = self.send(self.client.get(url.clone()))?;
            match response.status() {
                status if status.is_success() => {}
                StatusCode::NOT_FOUND => return Err(StoreError::not_found(operation, "list")),
                _ => return Err(unexpected(operation.to_string(), response)),
            }
            next = next_link(response.headers())
                .and_then(|link| self.endpoint.join(&link).ok())
                .filter(|candidate| *candidate != url);
            let body = self.read_body(response)?;
            collected.extend(extract(&body)?);
        }
        Ok(collected)
    }
}

impl ArtifactStore for OciStore {
    fn push(
        &self,
        repo: &RepoPath,
        tag: &VersionTag,
        request: PushRequest,
    ) -> Result<PushReceipt, StoreError> {
        let deadline = request.deadline;
        ensure_before(deadline, repo, "tag lookup")?;
        if self.manifest_exists(repo, tag.as_str())? {
            return Err(StoreError::TagConflict {
                repository: repo.to_string(),
                tag: tag.to_string(),
            });
        }
        let packed = manifest::pack(&request.stamped())?;
        for (digest, bytes) in packed.blobs {
            ensure_before(deadline, repo, "blob upload")?;
            if !self.blob_exists(repo, &digest)? {
                self.upload_blob(repo, &digest, bytes)?;
            }
        }
        ensure_before(deadline, repo, "version manifest push")?;
        let digest = self.put_manifest(repo, tag.as_str(), &packed.manifest)?;
        // The version is stored; past the deadline `latest` stays where it was.
        ensure_before(deadline, repo, "latest update")?;
        self.put_manifest(repo, LATEST, &packed.manifest)?;
        tracing::debug!(
            repository = %repo,
            tag = %tag,
            digest = %digest.short(),
            "artifact pushed"
        );
        Ok(PushReceipt {
            digest,
            tag: tag.clone(),
        })
    }

    fn push_latest(&self, repo: &RepoPath, request: PushRequest) -> Result<Digest, StoreError> {
        ensure_before(request.deadline, repo, "latest update")?;
        let packed = manifest::pack(&request.stamped())?;
        for (digest, bytes) in packed.blobs {
            if !self.blob_exists(repo, &digest)? {
                self.upload_blob(repo, &digest, bytes)?;
            }
        }
        let digest = self.put_manifest(repo, LATEST, &packed.manifest)?;
        tracing::debug!(repository = %repo, digest = %digest.short(), "latest replaced");
        Ok(digest)
    }

    fn pull(&self, repo: &RepoPath, reference: &Reference) -> Result<PulledArtifact, StoreError> {
        let (digest, manifest) = self.get_manifest(repo, reference)?;
        let layer = manifest.payload_layer(repo.as_str(), reference.as_str())?;
        let payload = self.get_blob(repo, reference, layer)?;
        Ok(PulledArtifact {
            digest,
            payload,
            annotations: manifest.merged_annotations(),
        })
    }

    fn list_repositories(&self, prefix: &RepoPath) -> Result<Vec<RepoPath>, StoreError> {
        let mut first = self.url("v2/_catalog")?;
        first
            .query_pairs_mut()
            .append_pair("n", &PAGE_SIZE.to_string());
        let names = self.paginate(first, "catalog", |body| {
            let page: CatalogPage = serde_json::from_slice(body).map_err(|err| {
                StoreError::malformed("_catalog", "list", format!("invalid catalog page: {err}"))
            })?;
            Ok(page.repositories.unwrap_or_default())
        })?;

        let mut repos: Vec<RepoPath> = names
            .into_iter()
            .filter_map(|name| RepoPath::parse(name).ok())
            .filter(|repo| repo == prefix || repo.strip_prefix(prefix).is_some())
            .collect();
        repos.sort();
        repos.dedup();
        Ok(repos)
    }

    fn list_tags(&self, repo: &RepoPath) -> Result<Vec<String>, StoreError> {
        let mut first = self.url(&format!("v2/{repo}/tags/list"))?;
        first
            .query_pairs_mut()
            .append_pair("n", &PAGE_SIZE.to_string());
        self.paginate(first, repo.as_str(), |body| {
            let page: TagsPage = serde_json::from_slice(body).map_err(|err| {
                StoreError::malformed(repo.as_str(), "tags", format!("invalid tag list: {err}"))
            })?;
            Ok(page.tags.unwrap_or_default())
        })
    }
}

#[derive(Deserialize)]
struct CatalogPage {
    repositories: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TagsPage {
    tags: Option<Vec<String>>,
}

fn unexpected(operation: String, response: Response) -> StoreError {
    let status = response.status().as_u16();
    let mut body = response.text().unwrap_or_default();
    if body.len() > BODY_EXCERPT {
        let mut cut = BODY_EXCERPT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    StoreError::Registry {
        operation,
        status,
        body,
    }
}

fn header_digest(headers: &HeaderMap) -> Option<Digest> {
    headers
        .get(CONTENT_DIGEST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Digest::parse(value.trim()).ok())
}

/// Extract the target of a `rel="next"` entry from a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|entry| {
            let mut parts = entry.split(';');
            let target = parts.next()?.trim();
            let is_next = parts.any(|param| {
                let param = param.trim().replace(' ', "");
                param == "rel=\"next\"" || param == "rel=next"
            });
            if !is_next {
                return None;
            }
            target
                .strip_prefix('<')
                .and_then(|rest| rest.strip_suffix('>'))
                .map(str::to_string)
        })
}
