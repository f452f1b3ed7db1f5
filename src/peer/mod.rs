pub mod connection;
pub mod ice;
pub mod media;
pub mod negotiator;
pub mod transport;
pub mod types;

pub use connection::{WebrtcTransport, GRACE_PERIOD};
pub use ice::{CandidateBuffer, RemoteCandidateDedup};
pub use media::{LocalMedia, LocalTrack, MediaKind, RemoteStream};
pub use negotiator::SessionNegotiator;
pub use transport::{MediaTransport, TransportEvent};
pub use types::{
    CallId, ConnectionState, IceCandidate, NegotiationState, Role, SdpKind, ServerConfig,
    SessionDescription,
};
