//! Deployment descriptors
//!
//! A descriptor declares services and volumes. It is read from one or more
//! compose-style YAML files, normalized into an immutable [`Descriptor`], and
//! checked by [`DescriptorValidator`] before anything is planned or started.

pub mod config;
pub mod model;
pub mod parser;
pub mod validator;

pub use config::DescriptorFile;
pub use model::{
    BuildSource, Descriptor, MountSource, PortMapping, Protocol, RestartPolicy, Service, Source,
    Volume, VolumeMount,
};
pub use parser::DescriptorParser;
pub use validator::DescriptorValidator;
