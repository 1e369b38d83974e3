// Language containers: installed tool runtimes and their activation

pub mod activation;
pub mod capability;
pub mod container;
pub mod installer;

pub use activation::ActivationKeys;
pub use capability::{ActiveEnvironment, Capability, LanguageKind, ListInsertion};
pub use container::{ActivationGuard, DeactivationGuard, LanguageContainer};
pub use installer::{Installer, InstallerRegistry};
