pub mod lifecycle;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod simulated;

pub use lifecycle::LifecycleManager;
pub use pairing::{PairingRenderer, QrPairingRenderer};
pub use protocol::{ChatProtocol, ProtocolConnection, ProtocolError, ProtocolEvent, ProtocolHandle};
pub use registry::{RegistryEntry, SessionRegistry};
pub use simulated::SimulatedProtocol;

#[cfg(any(test, feature = "testing"))]
pub use pairing::MockPairingRenderer;
#[cfg(any(test, feature = "testing"))]
pub use protocol::{MockChatProtocol, MockProtocolHandle};
