pub mod digest;
pub mod manifest;
pub mod memory;
pub mod platform;
pub mod reference;
pub mod registry;

pub use digest::Digest;
pub use manifest::{Descriptor, ImageConfig, ImageIndex, ImageManifest, ManifestKind};
pub use memory::MemoryRegistry;
pub use platform::{Platform, PlatformMatcher};
pub use reference::Reference;
pub use registry::{
    Describable, HttpRegistry, ManifestPayload, RawManifest, Registry, RegistryAuth,
    RegistryConfig, Taggable,
};
