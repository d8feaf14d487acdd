//! Core implementation crate for `svcfabric`. See the root `svcfabric`
//! crate for the public quick-start; this crate is re-exported wholesale
//! from there.
//!
//! Each subsystem is gated behind a Cargo feature so a host can build only
//! what it needs (`mesh` implies `registry`, since the mesh control plane
//! dispatches through the registry's selection API).

pub mod error;
pub mod events;
pub mod keyring;
pub mod task;

#[cfg(feature = "registry")]
pub mod registry;

#[cfg(feature = "mesh")]
pub mod mesh;

#[cfg(feature = "broker")]
pub mod broker;

#[cfg(feature = "streaming")]
pub mod streaming;

#[cfg(all(feature = "registry", feature = "mesh", feature = "broker", feature = "streaming"))]
pub mod fabric;

pub use error::{FabricError, FabricResult};
pub use events::{EventBus, FabricEvent, SubscriptionToken};
pub use keyring::{Cipher, KeyRing, KeyRingConfig, SealedPayload, XorStreamCipher};
pub use task::{CancelToken, Task};

#[cfg(all(feature = "registry", feature = "mesh", feature = "broker", feature = "streaming"))]
pub use fabric::{ServiceFabric, ServiceFabricConfig};
