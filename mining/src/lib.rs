//! Job Dispatcher (C3) and Session Manager (C5): job minting, vardiff, ban
//! policy, and the three wire variants (Stratum, WebSocket-GetWork, Xatum)
//! that drive one shared session contract (spec §4.3/§4.5).

pub mod ban;
pub mod dispatcher;
pub mod protocol;
pub mod session;
pub mod stratum;
pub mod vardiff;
pub mod ws_getwork;
pub mod xatum;

pub use ban::{BanPolicyConfig, BanRegistry};
pub use dispatcher::{DispatcherConfig, DispatcherError, JobDispatcher};
pub use protocol::{ProtocolConfig, ProtocolHandler, SubmitError, SubmitResult};
pub use session::{SessionHandle, SessionTable};
pub use vardiff::VardiffConfig;
