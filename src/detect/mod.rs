//! Object detection: the backend trait, the registry that routes work to
//! backends by capability, and the normalized result types.

mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::{DetectMode, DetectionCapability, DetectorBackend};
pub use backends::{StubBackend, StubScript};
pub use registry::{run_backend, BackendRegistry, SharedBackend};
pub use result::{BBox, Detection, PixelBox};
