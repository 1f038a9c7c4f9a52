pub mod russh_transport;
pub mod transport;
pub mod tunnel;

pub use russh_transport::RusshTransport;
pub use transport::{HostKeyPolicy, SshError, SshTransport};
pub use tunnel::{ChannelDialer, TunnelHandle};
