use serde::{Deserialize, Serialize};

use crate::broker::BrokerConfig;
use crate::error::BusError;
use crate::transport::Transport;

/// Where the shared bus lives.
///
/// Every component (broker, manager, launcher, client) takes one of these
/// explicitly; nothing reads the bus address from ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    /// Endpoint publishers connect to (broker SUB frontend).
    #[serde(default = "default_frontend")]
    pub frontend: String,

    /// Endpoint subscribers connect to (broker PUB backend).
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Broker REP health endpoint, probed before attaching.
    #[serde(default = "default_health")]
    pub health: String,
}

fn default_frontend() -> String {
    "tcp://127.0.0.1:5555".into()
}

fn default_backend() -> String {
    "tcp://127.0.0.1:5556".into()
}

fn default_health() -> String {
    "tcp://127.0.0.1:5557".into()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            frontend: default_frontend(),
            backend: default_backend(),
            health: default_health(),
        }
    }
}

impl BusConfig {
    /// Bus on `host` using three consecutive ports starting at `base_port`.
    pub fn tcp(host: &str, base_port: u16) -> Self {
        Self {
            frontend: format!("tcp://{host}:{base_port}"),
            backend: format!("tcp://{host}:{}", base_port + 1),
            health: format!("tcp://{host}:{}", base_port + 2),
        }
    }

    pub fn frontend_transport(&self) -> Result<Transport, BusError> {
        Transport::parse(&self.frontend)
    }

    pub fn backend_transport(&self) -> Result<Transport, BusError> {
        Transport::parse(&self.backend)
    }

    pub fn health_transport(&self) -> Result<Transport, BusError> {
        Transport::parse(&self.health)
    }

    /// Socket configuration for a broker serving this bus.
    pub fn broker_config(&self) -> Result<BrokerConfig, BusError> {
        Ok(BrokerConfig {
            frontend: self.frontend_transport()?,
            backend: self.backend_transport()?,
            health: self.health_transport()?,
        })
    }

    /// Ensure every endpoint parses and the three endpoints are distinct.
    pub fn validate(&self) -> Result<(), BusError> {
        self.broker_config()?;
        if self.frontend == self.backend
            || self.frontend == self.health
            || self.backend == self.health
        {
            return Err(BusError::Config(
                "bus frontend, backend and health endpoints must all differ".into(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides.
    ///
    /// - `DATASOURCE_BUS_FRONTEND` -> `bus.frontend`
    /// - `DATASOURCE_BUS_BACKEND` -> `bus.backend`
    /// - `DATASOURCE_BUS_HEALTH` -> `bus.health`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// arbitrary variable source.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DATASOURCE_BUS_FRONTEND") {
            self.frontend = v;
        }
        if let Some(v) = lookup("DATASOURCE_BUS_BACKEND") {
            self.backend = v;
        }
        if let Some(v) = lookup("DATASOURCE_BUS_HEALTH") {
            self.health = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_loopback() {
        let cfg = BusConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.frontend_transport().unwrap(), Transport::tcp("127.0.0.1", 5555));
        assert_eq!(cfg.backend_transport().unwrap(), Transport::tcp("127.0.0.1", 5556));
        assert_eq!(cfg.health_transport().unwrap(), Transport::tcp("127.0.0.1", 5557));
    }

    #[test]
    fn tcp_uses_consecutive_ports() {
        let cfg = BusConfig::tcp("10.1.2.3", 7000);
        assert_eq!(cfg.frontend, "tcp://10.1.2.3:7000");
        assert_eq!(cfg.backend, "tcp://10.1.2.3:7001");
        assert_eq!(cfg.health, "tcp://10.1.2.3:7002");
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let cfg: BusConfig = toml::from_str(r#"frontend = "tcp://bus.lan:6000""#).unwrap();
        assert_eq!(cfg.frontend, "tcp://bus.lan:6000");
        assert_eq!(cfg.backend, default_backend());
    }

    #[test]
    fn validate_rejects_shared_endpoints() {
        let cfg = BusConfig {
            frontend: "tcp://127.0.0.1:5555".into(),
            backend: "tcp://127.0.0.1:5555".into(),
            health: "tcp://127.0.0.1:5557".into(),
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("must all differ"));
    }

    #[test]
    fn validate_rejects_unknown_scheme() {
        let cfg = BusConfig {
            frontend: "redis://127.0.0.1:6379".into(),
            ..BusConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_replace_only_present_keys() {
        let mut cfg = BusConfig::default();
        cfg.apply_overrides_from(|key| match key {
            "DATASOURCE_BUS_BACKEND" => Some("tcp://10.0.0.5:7001".into()),
            _ => None,
        });
        assert_eq!(cfg.frontend, default_frontend());
        assert_eq!(cfg.backend, "tcp://10.0.0.5:7001");
        assert_eq!(cfg.health, default_health());
    }
}
