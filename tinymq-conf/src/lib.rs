#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use tinymq_utils::{deserialize_addr, deserialize_duration};

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/tinymq/tinymq").required(false))
            .add_source(File::with_name("tinymq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(config::Environment::with_prefix("tinymq").separator("__").try_parsing(true));

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(laddr) = opts.laddr {
            inner.listener.addr = laddr;
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("listener is {:?}", self.listener);
        log::info!("mqtt config is {:?}", self.mqtt);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    #[serde(default = "Listener::name_default")]
    pub name: String,
    #[serde(default = "Listener::addr_default", deserialize_with = "deserialize_addr")]
    pub addr: SocketAddr,
    #[serde(default = "Listener::backlog_default")]
    pub backlog: i32,
    #[serde(default)]
    pub nodelay: bool,
    #[serde(default = "Listener::reuseaddr_default")]
    pub reuseaddr: bool,
    #[serde(default)]
    pub reuseport: bool,
    //0 means unlimited
    #[serde(default = "Listener::max_packet_size_default")]
    pub max_packet_size: u32,
}

impl Default for Listener {
    #[inline]
    fn default() -> Self {
        Self {
            name: Self::name_default(),
            addr: Self::addr_default(),
            backlog: Self::backlog_default(),
            nodelay: false,
            reuseaddr: Self::reuseaddr_default(),
            reuseport: false,
            max_packet_size: Self::max_packet_size_default(),
        }
    }
}

impl Listener {
    fn name_default() -> String {
        "external/tcp".into()
    }
    fn addr_default() -> SocketAddr {
        ([0, 0, 0, 0], 1883).into()
    }
    fn backlog_default() -> i32 {
        1024
    }
    fn reuseaddr_default() -> bool {
        true
    }
    fn max_packet_size_default() -> u32 {
        1024 * 1024
    }
}

/// What the reader does when a client's inbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Wait up to `inbound_queue_timeout`, then disconnect the client.
    Block,
    /// Discard the newest packet and count it.
    Drop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    //Keep-alive applied when a client connects with 0, unit: seconds
    #[serde(default = "Mqtt::keepalive_default_default")]
    pub keepalive_default: u16,
    //Idle deadline is keepalive * keepalive_backoff
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    #[serde(default = "Mqtt::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,

    #[serde(default = "Mqtt::queue_capacity_default")]
    pub inbound_queue_capacity: usize,
    #[serde(default = "Mqtt::queue_capacity_default")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "Mqtt::inbound_queue_policy_default")]
    pub inbound_queue_policy: QueuePolicy,
    #[serde(default = "Mqtt::inbound_queue_timeout_default", deserialize_with = "deserialize_duration")]
    pub inbound_queue_timeout: Duration,

    //How long a new connection waits for the session it replaces to finish
    #[serde(default = "Mqtt::takeover_timeout_default", deserialize_with = "deserialize_duration")]
    pub takeover_timeout: Duration,
    #[serde(default = "Mqtt::shutdown_timeout_default", deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,

    //QoS 1/2 resend interval for unacknowledged messages, 0 disables resending
    #[serde(default = "Mqtt::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,
    #[serde(default = "Mqtt::max_retries_default")]
    pub max_retries: usize,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            keepalive_default: Self::keepalive_default_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            connect_timeout: Self::connect_timeout_default(),
            inbound_queue_capacity: Self::queue_capacity_default(),
            outbound_queue_capacity: Self::queue_capacity_default(),
            inbound_queue_policy: Self::inbound_queue_policy_default(),
            inbound_queue_timeout: Self::inbound_queue_timeout_default(),
            takeover_timeout: Self::takeover_timeout_default(),
            shutdown_timeout: Self::shutdown_timeout_default(),
            retry_interval: Self::retry_interval_default(),
            max_retries: Self::max_retries_default(),
        }
    }
}

impl Mqtt {
    fn keepalive_default_default() -> u16 {
        60
    }
    fn keepalive_backoff_default() -> f32 {
        1.5
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(2)
    }
    fn queue_capacity_default() -> usize {
        1000
    }
    fn inbound_queue_policy_default() -> QueuePolicy {
        QueuePolicy::Block
    }
    fn inbound_queue_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn takeover_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn shutdown_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    fn max_retries_default() -> usize {
        3
    }

    /// Idle deadline for a negotiated keep-alive, `None` when keep-alive is disabled.
    #[inline]
    pub fn idle_timeout(&self, keep_alive: u16) -> Option<Duration> {
        if keep_alive == 0 {
            None
        } else {
            Some(Duration::from_secs(keep_alive as u64).mul_f32(self.keepalive_backoff))
        }
    }
}
