use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the master process.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address worker connections are accepted on
    pub listen_addr: SocketAddr,
    /// How long a new connection may take to send its HELLO
    pub handshake_timeout_ms: u64,
    /// Liveness re-check tick of each node's dispatch loop
    pub dispatch_tick_ms: u64,
    /// Bound of the shared job queue feeding all nodes
    pub job_queue_capacity: usize,
    /// How long `Submission::stop` waits for the submit loop to acknowledge
    pub stop_ack_timeout_ms: u64,
    /// When set, batch output is also appended to `<dir>/<batch>.out.txt`
    /// and `<dir>/<batch>.err.txt`.
    pub output_dir: Option<PathBuf>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8083)),
            handshake_timeout_ms: 10_000,
            dispatch_tick_ms: 1_000,
            job_queue_capacity: 1_000,
            stop_ack_timeout_ms: 1_000,
            output_dir: None,
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    pub fn stop_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_ack_timeout_ms)
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// host:port of the master, supports both IP and hostnames
    pub master_addr: String,
    /// Number of jobs this worker will run at once
    pub job_capacity: usize,
    /// Interval between CHECKIN messages
    pub checkin_interval_ms: u64,
    /// Blocked output lines log a warning and retry on this period
    pub relay_retry_ms: u64,
    /// Bound of the outbound mailbox shared by all running jobs
    pub outbox_capacity: usize,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    /// Delay before honoring RESTART or DIE
    pub control_delay_ms: u64,
    /// Optional identity reported in the handshake
    pub identity_hint: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:8083".to_string(),
            job_capacity: 3,
            checkin_interval_ms: 60_000,
            relay_retry_ms: 1_000,
            outbox_capacity: 1_000,
            reconnect_min_ms: 500,
            reconnect_max_ms: 30_000,
            control_delay_ms: 2_000,
            identity_hint: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(master_addr: String, job_capacity: usize) -> Self {
        Self {
            master_addr,
            job_capacity,
            ..Default::default()
        }
    }

    pub fn with_identity_hint(mut self, hint: String) -> Self {
        self.identity_hint = Some(hint);
        self
    }

    pub fn checkin_interval(&self) -> Duration {
        Duration::from_millis(self.checkin_interval_ms)
    }

    pub fn relay_retry(&self) -> Duration {
        Duration::from_millis(self.relay_retry_ms)
    }

    pub fn control_delay(&self) -> Duration {
        Duration::from_millis(self.control_delay_ms)
    }
}
