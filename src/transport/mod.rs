pub mod negotiate;
pub mod tcp;
pub mod traits;

pub use negotiate::StaticNegotiator;
pub use tcp::{TcpConnector, TcpSession, TcpTarget};
pub use traits::{
    Credentials, Negotiator, OpenedSession, TransportConnector, TransportEvent, TransportEvents,
    TransportSession,
};
