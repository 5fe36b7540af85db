pub mod pool;
pub mod tunnel;

pub use tunnel::SshTunnel;
