pub mod cases;
pub mod digest;
pub mod session;


pub use cases::{hello_world, hello_world_host, CaseError, HeapReport};
pub use digest::{verify_firmware_digest, FirmwareDigest, VerifyError};
pub use session::{Captures, DeviceSession, SessionError, StreamSession};
