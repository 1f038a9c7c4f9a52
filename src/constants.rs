pub const HOST_NAME_PREFIX: &str = "dockbridge-";
pub const DATA_VOLUME_SUBSTR: &str = "dockbridge-docker-data";

pub const REMOTE_DOCKER_PORT: u16 = 2376;
pub const DEFAULT_KEEP_ALIVE_PORT: u16 = 8080;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";
pub const DEFAULT_SERVER_TYPE: &str = "cpx21";
pub const DEFAULT_LOCATION: &str = "fsn1";
pub const DEFAULT_VOLUME_SIZE_GIB: u32 = 10;

pub const DEFAULT_SSH_KEY_PATH: &str = "~/.dockbridge/ssh/id_rsa";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SSH_KEEP_ALIVE_SECS: u64 = 30;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const SSH_COMMAND_TIMEOUT_SECS: u64 = 20;
pub const CREATE_TUNNEL_TIMEOUT_SECS: u64 = 30;
pub const DAEMON_PING_TIMEOUT_SECS: u64 = 10;
pub const DAEMON_PING_VERIFY_ATTEMPTS: u32 = 10;
pub const DAEMON_PING_RETRY_GAP_SECS: u64 = 3;
pub const READINESS_STEP_TIMEOUT_SECS: u64 = 20;
pub const READINESS_TOTAL_TIMEOUT_SECS: u64 = 10 * 60;
pub const PROVISIONING_TOTAL_TIMEOUT_SECS: u64 = 10 * 60;

pub const SSH_CONNECT_ATTEMPTS: u32 = 5;
pub const SSH_CONNECT_BACKOFF_STEP_SECS: u64 = 2;

pub const SUPERVISOR_BACKOFF_BASE_SECS: u64 = 1;
pub const SUPERVISOR_BACKOFF_CAP_SECS: u64 = 60;

pub const READINESS_POLL_PERIOD_SECS: u64 = 15;

pub const LIFECYCLE_TICK_SECS: u64 = 5;
pub const LIFECYCLE_HOST_CACHE_TTL_SECS: u64 = 30;

pub const COPY_BUFFER_SIZE: usize = 32 * 1024;
