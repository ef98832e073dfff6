use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::lease::{ClientId, LeaseTiming};

/// Shortest lease the server will grant, whatever the client asks for.
pub const MIN_LEASE_SECONDS: u32 = 60;

const MAX_HOSTNAME_LENGTH: usize = 63;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    #[serde(default)]
    pub excluded_addresses: Vec<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub lease_duration_seconds: u32,
    #[serde(default)]
    pub max_lease_duration_seconds: Option<u32>,
    pub renewal_time_seconds: Option<u32>,
    pub rebinding_time_seconds: Option<u32>,
    #[serde(default = "default_offer_timeout")]
    pub offer_timeout_seconds: u32,
    #[serde(default = "default_decline_quarantine")]
    pub decline_quarantine_seconds: u32,
    #[serde(default = "default_scheduler_tick")]
    pub scheduler_tick_millis: u64,
    pub broadcast_address: Option<Ipv4Addr>,
    pub mtu: Option<u16>,
    pub static_bindings: Vec<StaticBinding>,
    #[serde(default)]
    pub conflict_probe: ConflictProbeConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub known_clients_only: bool,
    #[serde(default)]
    pub known_clients: Vec<String>,
    pub leases_file: String,
    pub interface_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticBinding {
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
    pub hostname: Option<String>,
}

impl StaticBinding {
    /// Client identity the binding is keyed on (htype 1 + MAC).
    pub fn client_id(&self) -> Result<ClientId> {
        ClientId::from_mac_or_hex(&self.mac_address)
    }
}

/// Reachability check performed on a candidate before it is offered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictProbeConfig {
    pub enabled: bool,
    pub timeout_millis: u64,
    pub attempts: u32,
}

impl Default for ConflictProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_millis: 500,
            attempts: 1,
        }
    }
}

/// Per-client sliding window applied to DISCOVER and REQUEST.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 1,
            max_requests: 10,
        }
    }
}

fn default_offer_timeout() -> u32 {
    30
}

fn default_decline_quarantine() -> u32 {
    3600
}

fn default_scheduler_tick() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 200),
            excluded_addresses: Vec::new(),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            domain_name: None,
            lease_duration_seconds: 86400,
            max_lease_duration_seconds: None,
            renewal_time_seconds: None,
            rebinding_time_seconds: None,
            offer_timeout_seconds: default_offer_timeout(),
            decline_quarantine_seconds: default_decline_quarantine(),
            scheduler_tick_millis: default_scheduler_tick(),
            broadcast_address: None,
            mtu: None,
            static_bindings: Vec::new(),
            conflict_probe: ConflictProbeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            known_clients_only: false,
            known_clients: Vec::new(),
            leases_file: "leases.jsonl".to_string(),
            interface_index: None,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);

        if start > end {
            return Err(Error::InvalidConfig(
                "pool_start must be less than or equal to pool_end".to_string(),
            ));
        }

        let server = u32::from(self.server_ip);
        if server >= start && server <= end {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the pool range".to_string(),
            ));
        }

        if let Some(gateway) = self.gateway {
            let gw = u32::from(gateway);
            if gw >= start && gw <= end {
                return Err(Error::InvalidConfig(
                    "gateway must not be within the pool range".to_string(),
                ));
            }
        }

        for binding in &self.static_bindings {
            if !self.ip_in_pool(binding.ip_address) {
                return Err(Error::InvalidConfig(format!(
                    "static binding {} for MAC {} is outside the pool range",
                    binding.ip_address, binding.mac_address
                )));
            }
            if self.is_excluded(binding.ip_address) {
                return Err(Error::InvalidConfig(format!(
                    "static binding {} for MAC {} is an excluded address",
                    binding.ip_address, binding.mac_address
                )));
            }
            binding.client_id().map_err(|_| {
                Error::InvalidConfig(format!(
                    "static binding {} has an invalid MAC address {}",
                    binding.ip_address, binding.mac_address
                ))
            })?;
        }

        for client in &self.known_clients {
            ClientId::from_mac_or_hex(client).map_err(|_| {
                Error::InvalidConfig(format!("known client {} is not a valid identifier", client))
            })?;
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if let Some(max) = self.max_lease_duration_seconds
            && max < self.lease_duration_seconds
        {
            return Err(Error::InvalidConfig(
                "max_lease_duration_seconds must not be less than lease_duration_seconds"
                    .to_string(),
            ));
        }

        if let Some(renewal) = self.renewal_time_seconds
            && renewal >= self.lease_duration_seconds
        {
            return Err(Error::InvalidConfig(
                "renewal_time_seconds must be less than lease_duration_seconds".to_string(),
            ));
        }

        if let Some(rebinding) = self.rebinding_time_seconds {
            let renewal = self.renewal_seconds(self.lease_duration_seconds);
            if rebinding <= renewal || rebinding >= self.lease_duration_seconds {
                return Err(Error::InvalidConfig(
                    "rebinding_time_seconds must lie between renewal time and lease duration"
                        .to_string(),
                ));
            }
        }

        if self.offer_timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.scheduler_tick_millis == 0 {
            return Err(Error::InvalidConfig(
                "scheduler_tick_millis must be greater than 0".to_string(),
            ));
        }

        if self.conflict_probe.attempts == 0 {
            return Err(Error::InvalidConfig(
                "conflict_probe.attempts must be at least 1".to_string(),
            ));
        }

        if self.rate_limit.max_requests == 0 || self.rate_limit.window_seconds == 0 {
            return Err(Error::InvalidConfig(
                "rate_limit window and request budget must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);
        addr >= start && addr <= end
    }

    pub fn is_excluded(&self, ip: Ipv4Addr) -> bool {
        self.excluded_addresses.contains(&ip)
    }

    /// Pool range minus exclusions, in ascending order.
    pub fn pool_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (u32::from(self.pool_start)..=u32::from(self.pool_end))
            .map(Ipv4Addr::from)
            .filter(|ip| !self.is_excluded(*ip))
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.pool_end) - u32::from(self.pool_start) + 1
    }

    pub fn max_lease_seconds(&self) -> u32 {
        self.max_lease_duration_seconds
            .unwrap_or(self.lease_duration_seconds)
    }

    /// T1 for a lease of `duration` seconds.
    ///
    /// The configured override only applies while it still fits inside the
    /// lease; otherwise T1 is 50% of the duration.
    pub fn renewal_seconds(&self, duration: u32) -> u32 {
        match self.renewal_time_seconds {
            Some(renewal) if renewal < duration => renewal,
            _ => duration / 2,
        }
    }

    /// T2 for a lease of `duration` seconds, 87.5% unless overridden.
    pub fn rebinding_seconds(&self, duration: u32) -> u32 {
        let renewal = self.renewal_seconds(duration);
        match self.rebinding_time_seconds {
            Some(rebinding) if rebinding > renewal && rebinding < duration => rebinding,
            _ => (u64::from(duration) * 7 / 8) as u32,
        }
    }

    pub fn lease_timing(&self, duration: u32) -> LeaseTiming {
        LeaseTiming {
            duration,
            renewal: self.renewal_seconds(duration),
            rebinding: self.rebinding_seconds(duration),
        }
    }

    pub fn calculate_broadcast(&self) -> Ipv4Addr {
        if let Some(broadcast) = self.broadcast_address {
            return broadcast;
        }

        let ip = u32::from(self.server_ip);
        let mask = u32::from(self.subnet_mask);
        let broadcast = ip | !mask;
        Ipv4Addr::from(broadcast)
    }
}

/// Reduces a client supplied hostname to a safe DNS label.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`, strips leading and trailing
/// dots and dashes, and caps the result at 63 characters.
pub fn sanitize_hostname(name: &str) -> String {
    let filtered: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    filtered
        .trim_matches(|c| c == '.' || c == '-')
        .chars()
        .take(MAX_HOSTNAME_LENGTH)
        .collect()
}
