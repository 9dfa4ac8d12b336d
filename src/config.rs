use std::time::Duration;

use anyhow::bail;


pub const MAX_FRAME_LEN_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub listen_port: u16,
    /// All peers listen on the same well-known port, so this is the port used to reach a peer
    ///  given only its IP address
    pub peer_port: u16,

    pub ack_timeout: Duration,
    pub dial_timeout: Duration,
    /// upper bound for the declared length of a single wire frame; peers exceeding this are
    ///  disconnected
    pub max_frame_len: usize,
    pub outgoing_buffer: usize,
    pub pool_inbound_buffer: usize,

    pub send_attempts: u32,
    pub send_retry_delay: Duration,

    /// how long a message relayed on behalf of another node is protected from cleanup
    pub expiring_immunity_period: Duration,
    pub user_ip_expiry: Duration,

    pub resend_interval: Duration,
    pub max_peers_per_resend_tick: usize,
    pub pending_cleanup_interval: Duration,

    pub directory_expiry: Duration,
    pub directory_request_timeout: Duration,
}

impl MessengerConfig {
    pub fn new(listen_port: u16) -> MessengerConfig {
        MessengerConfig {
            listen_port,
            peer_port: listen_port,
            ack_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            max_frame_len: MAX_FRAME_LEN_LIMIT,
            outgoing_buffer: 64,
            pool_inbound_buffer: 128,
            send_attempts: 3,
            send_retry_delay: Duration::from_secs(2),
            expiring_immunity_period: Duration::from_secs(30),
            user_ip_expiry: Duration::from_secs(30),
            resend_interval: Duration::from_secs(5),
            max_peers_per_resend_tick: 10,
            pending_cleanup_interval: Duration::from_secs(60),
            directory_expiry: Duration::from_secs(30),
            directory_request_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_attempts == 0 {
            bail!("send_attempts must be at least 1");
        }
        if self.max_peers_per_resend_tick == 0 {
            bail!("max_peers_per_resend_tick must be at least 1");
        }
        if self.max_frame_len == 0 || self.max_frame_len > MAX_FRAME_LEN_LIMIT {
            bail!("max_frame_len must be between 1 and {}", MAX_FRAME_LEN_LIMIT);
        }
        if self.outgoing_buffer == 0 || self.pool_inbound_buffer == 0 {
            bail!("channel buffers must not be empty");
        }

        for (name, value) in [
            ("ack_timeout", self.ack_timeout),
            ("dial_timeout", self.dial_timeout),
            ("resend_interval", self.resend_interval),
            ("pending_cleanup_interval", self.pending_cleanup_interval),
            ("directory_request_timeout", self.directory_request_timeout),
        ] {
            if value.is_zero() {
                bail!("{} must not be zero", name);
            }
        }

        Ok(())
    }
}
