//! The shared browser surface
//!
//! One expensive, stateful, effectively single-threaded rendering resource
//! is shared by every driving component. This module owns its lifecycle:
//! lazy creation, serialized checkout, reset between uses.

pub mod manager;

pub use manager::{SurfaceConfig, SurfaceConfigBuilder, SurfaceLease, SurfaceManager};
