//! KNXnet/IP access protocol: frame envelope, service bodies, and constants
//! used to tunnel cEMI frames over UDP.

pub mod constants;
pub mod frame;
pub mod services;

pub use constants::ServiceType;
pub use frame::{FrameBuilder, Hpai, KnxnetIpFrame, KnxnetIpHeader};
pub use services::{
    ConnectRequest, ConnectResponse, ConnectionHeader, ConnectionRequestInfo,
    ConnectionStateRequest, ConnectionStateResponse, DisconnectRequest, DisconnectResponse,
    TunnelingAck, TunnelingRequest,
};
