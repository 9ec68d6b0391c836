//! Service manifest parsing and normalization for berth.
//!
//! A service version is published either as a native JSON manifest or as a
//! compose file with env side-car files. Both shapes normalize into one
//! [`ServiceDescription`], wrapped per version by [`VersionedDescription`].

pub mod compose;
pub mod description;
pub mod envfile;
pub mod native;
pub mod types;
pub mod versioned;

pub use compose::{sibling_url, ComposeDescription, ComposeFile};
pub use description::{
    ContainerSpec, DescriptionError, EnvDeclaration, ImageSource, NetworkAttachment, NetworkSpec,
    PortMapping, ServiceDescription, VolumeMount, VolumeSpec,
};
pub use envfile::parse_env_file;
pub use native::NativeDescription;
pub use types::{ContainerId, ImageId, NetworkId, VolumeId};
pub use versioned::{
    ManifestFormat, ManifestOrigin, RawDescription, VersionedDescription, COMPOSE_FILE,
    ORIGIN_FILE,
};
