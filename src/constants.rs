// Centralized constants for layerstack to avoid magic strings and numbers

/// OCI image manifest media type
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index media type
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image config media type
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// OCI gzip layer media type
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker schema 2 manifest media type
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker manifest list media type
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image config media type
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Docker gzip layer media type
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Annotation recording the digest of the image layers were appended to
pub const ANNOTATION_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

/// Annotation recording the reference of the base image
pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";

/// BuildKit annotation marking the kind of a referring index entry
pub const REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

/// Value of [`REFERENCE_TYPE_ANNOTATION`] for attestation manifests
pub const REFERENCE_TYPE_ATTESTATION: &str = "attestation-manifest";

/// BuildKit annotation naming the manifest an attestation refers to
pub const REFERENCE_DIGEST_ANNOTATION: &str = "vnd.docker.reference.digest";

/// Platform string BuildKit gives attestation manifests
pub const ATTESTATION_PLATFORM: &str = "unknown/unknown";

/// Default mode for regular files in built layers
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Mode for regular files whose source has any executable bit
pub const DEFAULT_EXECUTABLE_MODE: u32 = 0o755;

/// Permission bits taken from the source file under the preserve policy
pub const PERMISSION_MASK: u32 = 0o777;

/// Any of the executable bits
pub const EXECUTABLE_MASK: u32 = 0o111;

/// Symlink entries carry no meaningful permissions
pub const SYMLINK_MODE: u32 = 0o777;

/// Minimum interval between logged push progress updates (1 second)
pub const PROGRESS_REPORT_MIN_INTERVAL_MS: u64 = 1000;

/// Capacity of the push progress channel
pub const PROGRESS_CHANNEL_CAPACITY: usize = 200;

/// History entry recorded in the image config for every appended layer
pub const HISTORY_CREATED_BY: &str = "layerstack append";

/// Timestamp used for history entries so configs stay reproducible
pub const EPOCH_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// Value substituted for `${PATH}` when the base image defines no PATH
pub const FALLBACK_PATH_VALUE: &str = "/usr/bin";

/// Registry used when a reference names none
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a reference has neither tag nor digest
pub const DEFAULT_TAG: &str = "latest";
