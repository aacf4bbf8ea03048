pub mod rest;
pub mod stream_ws;

pub use rest::{HttpResponse, HttpTransport, ReqwestTransport};
pub use stream_ws::{
    ClientMessage, Frame, Outbound, ServerMessage, StreamConnector, TradeData, WireHalves,
    WireSink, WireStream, WsConnector, POLICY_VIOLATION,
};
