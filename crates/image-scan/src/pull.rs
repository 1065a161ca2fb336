//! Image pull abstraction and registry v2 implementation.
//!
//! The [`ImagePuller`] trait is the seam between scan scheduling and image
//! acquisition, allowing production code to use [`RegistryImagePuller`]
//! while tests materialize fixture filesystems with a mock.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐
//! │ ScanScheduler │
//! └──────┬────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ ImagePuller │ (trait)
//! └─────────────┘
//!     │      │
//!     ▼      ▼
//! ┌───────┐ ┌──────┐
//! │ HTTP  │ │ Mock │
//! │ v2    │ └──────┘
//! └───┬───┘
//!     │
//!     ▼
//! container registry
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use podsentry_core::config::RegistryAuth;
use podsentry_core::types::{ImageMetadata, ImageReference};

use crate::error::ImageScanError;
use crate::workdir::ScanWorkdir;

/// Accept header covering the Docker v2 and OCI manifest media types.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// An image pulled onto the local filesystem, ready for inspection.
#[derive(Debug)]
pub struct PulledImage {
    /// Resolved content digest of the image manifest.
    pub digest: String,
    /// Root of the flattened image filesystem.
    pub rootfs: PathBuf,
    /// Metadata attached to every scan result for this image.
    pub image_metadata: ImageMetadata,
}

/// Trait abstracting image acquisition.
///
/// # Implementations
///
/// - [`RegistryImagePuller`]: production implementation speaking the
///   registry v2 HTTP API
/// - `MockImagePuller`: test implementation returning fixture filesystems
pub trait ImagePuller: Send + Sync + 'static {
    /// Resolves the image reference to its content digest without pulling.
    ///
    /// Digest references resolve to themselves without a network call.
    fn resolve_digest(
        &self,
        image: &ImageReference,
    ) -> impl Future<Output = Result<String, ImageScanError>> + Send;

    /// Pulls the image and flattens its layers into the workdir's rootfs.
    fn pull(
        &self,
        image: &ImageReference,
        workdir: &ScanWorkdir,
    ) -> impl Future<Output = Result<PulledImage, ImageScanError>> + Send;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    /// Present on manifest lists / OCI indexes only.
    #[serde(default)]
    manifests: Vec<PlatformDescriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct PlatformDescriptor {
    digest: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    os: Option<String>,
    architecture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Production puller speaking the registry v2 HTTP API.
///
/// Handles the Bearer token challenge flow; private registries get Basic
/// credentials from the `[scan.registry_auth]` config entries, keyed by
/// registry host.
pub struct RegistryImagePuller {
    http: reqwest::Client,
    /// registry host -> (username, password)
    credentials: HashMap<String, (String, String)>,
}

impl RegistryImagePuller {
    /// Creates a puller with the given per-registry credentials.
    pub fn new(auth: &[RegistryAuth]) -> Result<Self, ImageScanError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ImageScanError::Network(e.to_string()))?;
        let credentials = auth
            .iter()
            .map(|entry| {
                (
                    entry.registry.clone(),
                    (entry.username.clone(), entry.password.clone()),
                )
            })
            .collect();
        Ok(Self { http, credentials })
    }

    /// The `docker.io` alias is served by a differently named host.
    fn registry_host(image: &ImageReference) -> &str {
        if image.registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            &image.registry
        }
    }

    /// Loopback registries are served without TLS, everything else over HTTPS.
    fn scheme(host: &str) -> &'static str {
        let name = host.rsplit_once(':').map_or(host, |(name, _)| name);
        if name == "localhost" || name == "127.0.0.1" {
            "http"
        } else {
            "https"
        }
    }

    fn manifest_url(image: &ImageReference, reference: &str) -> String {
        let host = Self::registry_host(image);
        format!(
            "{}://{}/v2/{}/manifests/{}",
            Self::scheme(host),
            host,
            image.repository,
            reference,
        )
    }

    fn blob_url(image: &ImageReference, digest: &str) -> String {
        let host = Self::registry_host(image);
        format!(
            "{}://{}/v2/{}/blobs/{}",
            Self::scheme(host),
            host,
            image.repository,
            digest,
        )
    }

    /// Performs the Bearer token flow from a `WWW-Authenticate` challenge.
    async fn fetch_token(
        &self,
        image: &ImageReference,
        challenge: &str,
    ) -> Result<String, ImageScanError> {
        let params = parse_bearer_challenge(challenge)
            .ok_or_else(|| ImageScanError::Auth(format!("unsupported challenge: {challenge}")))?;
        let realm = params
            .get("realm")
            .ok_or_else(|| ImageScanError::Auth("challenge missing realm".to_owned()))?;

        let mut request = self.http.get(realm).query(&[
            ("scope", format!("repository:{}:pull", image.repository)),
        ]);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Some((user, pass)) = self.credentials.get(&image.registry) {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageScanError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ImageScanError::Auth(format!(
                "token endpoint returned {}",
                response.status(),
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ImageScanError::Auth(e.to_string()))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| ImageScanError::Auth("token response had no token".to_owned()))
    }

    /// Sends a request, retrying once with a Bearer token on 401.
    async fn send_authorized(
        &self,
        image: &ImageReference,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ImageScanError> {
        let mut request = build().header("Accept", MANIFEST_ACCEPT);
        if let Some((user, pass)) = self.credentials.get(&image.registry) {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .await
            .map_err(|e| ImageScanError::Network(e.to_string()))?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return check_status(response);
        }

        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let token = self.fetch_token(image, &challenge).await?;

        let retried = build()
            .header("Accept", MANIFEST_ACCEPT)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ImageScanError::Network(e.to_string()))?;
        check_status(retried)
    }

    /// Fetches the manifest, following one level of manifest-list indirection.
    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        reference: &str,
    ) -> Result<Manifest, ImageScanError> {
        let url = Self::manifest_url(image, reference);
        let response = self
            .send_authorized(image, || self.http.get(&url))
            .await?;
        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| ImageScanError::Manifest(e.to_string()))?;

        if manifest.manifests.is_empty() {
            return Ok(manifest);
        }

        // Manifest list: pick a linux entry, preferring amd64
        let selected = manifest
            .manifests
            .iter()
            .filter(|m| {
                m.platform
                    .as_ref()
                    .and_then(|p| p.os.as_deref())
                    .is_none_or(|os| os == "linux")
            })
            .max_by_key(|m| {
                let arch = m.platform.as_ref().and_then(|p| p.architecture.as_deref());
                usize::from(arch == Some("amd64"))
            })
            .ok_or_else(|| {
                ImageScanError::Manifest(format!(
                    "no linux manifest in list ({})",
                    manifest.media_type.as_deref().unwrap_or("unknown media type"),
                ))
            })?;

        debug!(digest = %selected.digest, "resolved manifest list entry");
        let nested_url = Self::manifest_url(image, &selected.digest);
        let nested = self
            .send_authorized(image, || self.http.get(&nested_url))
            .await?;
        nested
            .json()
            .await
            .map_err(|e| ImageScanError::Manifest(e.to_string()))
    }

    /// Downloads one blob to a file in the workdir.
    async fn download_blob(
        &self,
        image: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<(), ImageScanError> {
        let url = Self::blob_url(image, digest);
        let mut response = self
            .send_authorized(image, || self.http.get(&url))
            .await?;

        let mut file = std::fs::File::create(dest)?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ImageScanError::Network(e.to_string()))?
        {
            file.write_all(&chunk)?;
        }
        Ok(())
    }
}

impl ImagePuller for RegistryImagePuller {
    async fn resolve_digest(&self, image: &ImageReference) -> Result<String, ImageScanError> {
        if image.is_digest() {
            return Ok(image.reference.clone());
        }

        let url = Self::manifest_url(image, &image.reference);
        let response = self
            .send_authorized(image, || self.http.head(&url))
            .await?;
        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                ImageScanError::Manifest("registry did not return a content digest".to_owned())
            })
    }

    async fn pull(
        &self,
        image: &ImageReference,
        workdir: &ScanWorkdir,
    ) -> Result<PulledImage, ImageScanError> {
        let digest = self.resolve_digest(image).await?;
        let manifest = self.fetch_manifest(image, &image.reference).await?;
        if manifest.layers.is_empty() {
            return Err(ImageScanError::Manifest("manifest has no layers".to_owned()));
        }

        // 레이어는 아래에서 위 순서로 같은 rootfs에 겹쳐 전개됩니다
        for (index, layer) in manifest.layers.iter().enumerate() {
            let blob_path = workdir.path().join(format!("layer-{index}.tar"));
            self.download_blob(image, &layer.digest, &blob_path).await?;

            let rootfs = workdir.rootfs().to_path_buf();
            let blob = blob_path.clone();
            tokio::task::spawn_blocking(move || unpack_layer(&blob, &rootfs))
                .await
                .map_err(|e| ImageScanError::Unpack(format!("unpack task failed: {e}")))??;

            // Blob is no longer needed once applied
            let _ = std::fs::remove_file(&blob_path);
            debug!(layer = index, digest = %layer.digest, "applied image layer");
        }

        Ok(PulledImage {
            digest: digest.clone(),
            rootfs: workdir.rootfs().to_path_buf(),
            image_metadata: ImageMetadata {
                image: image.to_string(),
                digest,
            },
        })
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ImageScanError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        Err(ImageScanError::Auth(format!("registry returned {status}")))
    } else {
        Err(ImageScanError::Registry {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("unknown").to_owned(),
        })
    }
}

/// Parses `Bearer realm="…",service="…"` challenge parameters.
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        params.insert(key.to_owned(), value.trim_matches('"').to_owned());
    }
    Some(params)
}

/// AUFS whiteout prefix marking deletions in upper layers.
const WHITEOUT_PREFIX: &str = ".wh.";
/// Opaque whiteout: hides the entire directory content from lower layers.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Applies one layer tarball onto the rootfs (blocking).
///
/// Handles both gzipped and plain tarballs, and AUFS whiteout markers.
/// Entries that cannot be materialized without privileges (device nodes,
/// broken hardlinks) are skipped, not fatal.
fn unpack_layer(blob: &Path, rootfs: &Path) -> Result<(), ImageScanError> {
    let mut file = std::fs::File::open(blob)?;
    let mut magic = [0u8; 2];
    let gzipped = file.read(&mut magic)? == 2 && magic == [0x1f, 0x8b];
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_preserve_mtime(false);

    for entry in archive
        .entries()
        .map_err(|e| ImageScanError::Unpack(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| ImageScanError::Unpack(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| ImageScanError::Unpack(e.to_string()))?
            .into_owned();

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if file_name.starts_with(WHITEOUT_PREFIX) {
            apply_whiteout(rootfs, &path, file_name);
            continue;
        }

        // unpack_in rejects paths escaping the rootfs on its own
        if let Err(e) = entry.unpack_in(rootfs) {
            debug!(path = %path.display(), error = %e, "skipping unextractable entry");
        }
    }
    Ok(())
}

fn apply_whiteout(rootfs: &Path, entry_path: &Path, file_name: &str) {
    let parent = entry_path.parent().unwrap_or_else(|| Path::new(""));
    if file_name == OPAQUE_WHITEOUT {
        let dir = rootfs.join(parent);
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for child in entries.flatten() {
                let path = child.path();
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if let Err(e) = result {
                    warn!(path = %path.display(), error = %e, "opaque whiteout cleanup failed");
                }
            }
        }
        return;
    }

    let target = rootfs
        .join(parent)
        .join(file_name.trim_start_matches(WHITEOUT_PREFIX));
    let result = if target.is_dir() {
        std::fs::remove_dir_all(&target)
    } else {
        std::fs::remove_file(&target)
    };
    if let Err(e) = result
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %target.display(), error = %e, "whiteout cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_challenge_parsing() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");

        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
    }

    #[test]
    fn docker_io_maps_to_registry_host() {
        let image = ImageReference::parse("nginx:1.27").unwrap();
        assert_eq!(RegistryImagePuller::registry_host(&image), "registry-1.docker.io");

        let private = ImageReference::parse("registry.corp:5000/team/api").unwrap();
        assert_eq!(RegistryImagePuller::registry_host(&private), "registry.corp:5000");
    }

    #[test]
    fn manifest_urls() {
        let image = ImageReference::parse("grafana/loki:2.9").unwrap();
        assert_eq!(
            RegistryImagePuller::manifest_url(&image, "2.9"),
            "https://registry-1.docker.io/v2/grafana/loki/manifests/2.9",
        );
        assert_eq!(
            RegistryImagePuller::blob_url(&image, "sha256:abcd"),
            "https://registry-1.docker.io/v2/grafana/loki/blobs/sha256:abcd",
        );
    }

    #[test]
    fn loopback_registries_use_plain_http() {
        let local = ImageReference::parse("localhost:5000/dev/app:1").unwrap();
        assert!(
            RegistryImagePuller::manifest_url(&local, "1")
                .starts_with("http://localhost:5000/v2/"),
        );

        let loopback = ImageReference::parse("127.0.0.1:5000/dev/app:1").unwrap();
        assert!(
            RegistryImagePuller::blob_url(&loopback, "sha256:abcd")
                .starts_with("http://127.0.0.1:5000/v2/"),
        );

        let remote = ImageReference::parse("registry.corp:5000/team/api:v2").unwrap();
        assert!(
            RegistryImagePuller::manifest_url(&remote, "v2")
                .starts_with("https://registry.corp:5000/v2/"),
        );
    }

    #[tokio::test]
    async fn digest_reference_resolves_without_network() {
        let puller = RegistryImagePuller::new(&[]).unwrap();
        let image = ImageReference::parse("gcr.io/distroless/static@sha256:0123abcd").unwrap();
        let digest = puller.resolve_digest(&image).await.unwrap();
        assert_eq!(digest, "sha256:0123abcd");
    }

    #[test]
    fn unpack_layer_applies_files_and_whiteouts() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/removed.conf"), "old").unwrap();

        // etc/kept.conf 추가 + etc/removed.conf whiteout인 레이어 생성
        let blob = dir.path().join("layer.tar");
        {
            let file = std::fs::File::create(&blob).unwrap();
            let mut builder = tar::Builder::new(file);

            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "etc/kept.conf", "new\n".as_bytes())
                .unwrap();

            let mut wh = tar::Header::new_gnu();
            wh.set_size(0);
            wh.set_mode(0o644);
            wh.set_cksum();
            builder
                .append_data(&mut wh, "etc/.wh.removed.conf", std::io::empty())
                .unwrap();
            builder.finish().unwrap();
        }

        unpack_layer(&blob, &rootfs).unwrap();
        assert!(rootfs.join("etc/kept.conf").exists());
        assert!(!rootfs.join("etc/removed.conf").exists());
    }

    #[test]
    fn unpack_layer_handles_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();

        let blob = dir.path().join("layer.tar.gz");
        {
            let file = std::fs::File::create(&blob).unwrap();
            let gz = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "hello.txt", "world".as_bytes())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        unpack_layer(&blob, &rootfs).unwrap();
        assert_eq!(
            std::fs::read_to_string(rootfs.join("hello.txt")).unwrap(),
            "world",
        );
    }

    #[test]
    fn opaque_whiteout_clears_directory() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().to_path_buf();
        std::fs::create_dir_all(rootfs.join("opt/app")).unwrap();
        std::fs::write(rootfs.join("opt/app/a.txt"), "a").unwrap();
        std::fs::write(rootfs.join("opt/app/b.txt"), "b").unwrap();

        apply_whiteout(&rootfs, Path::new("opt/app/.wh..wh..opq"), OPAQUE_WHITEOUT);
        assert!(rootfs.join("opt/app").exists());
        assert_eq!(std::fs::read_dir(rootfs.join("opt/app")).unwrap().count(), 0);
    }
}
