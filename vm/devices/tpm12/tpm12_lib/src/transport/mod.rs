// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Concrete [`Tpm12Transport`] implementations and their configuration.

mod device;
mod mssim;

pub use device::DeviceTransport;
pub use mssim::MssimTransport;

use crate::Tpm12Error;
use crate::Tpm12Transport;
use crate::simulator::SimulatorConfigError;
use crate::simulator::Tpm12Simulator;
use crate::simulator::Tpm12SimulatorConfig;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default TPM 1.2 character device on Linux.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpm0";

/// Default port of the TPM simulator command channel.
pub const DEFAULT_MSSIM_PORT: u16 = 2321;

/// Default timeout, in milliseconds, of each simulator read or write.
pub const DEFAULT_MSSIM_TIMEOUT_MS: u64 = 5000;

/// Selects and configures the transport used to reach a TPM 1.2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Tpm12TransportConfig {
    /// A TPM character device such as `/dev/tpm0`.
    Device {
        /// Path of the device node.
        #[serde(default = "default_device_path")]
        path: PathBuf,
    },
    /// A TPM simulator reachable over TCP with the mssim command protocol.
    Mssim {
        /// Host name or IP address. IPv6 literals are given without brackets.
        #[serde(default = "default_mssim_host")]
        host: String,
        /// Port of the command channel.
        #[serde(default = "default_mssim_port")]
        port: u16,
        /// Timeout of each read or write, in milliseconds.
        #[serde(default = "default_mssim_timeout_ms")]
        timeout_ms: u64,
    },
    /// The in-process simulator.
    Simulator(Tpm12SimulatorConfig),
}

fn default_device_path() -> PathBuf {
    DEFAULT_DEVICE_PATH.into()
}

fn default_mssim_host() -> String {
    "localhost".into()
}

fn default_mssim_port() -> u16 {
    DEFAULT_MSSIM_PORT
}

fn default_mssim_timeout_ms() -> u64 {
    DEFAULT_MSSIM_TIMEOUT_MS
}

impl Default for Tpm12TransportConfig {
    fn default() -> Self {
        Self::Device {
            path: default_device_path(),
        }
    }
}

/// Errors opening a transport with [`open_transport`].
#[derive(Debug, Error)]
pub enum OpenTransportError {
    /// The device node could not be opened.
    #[error("failed to open TPM device")]
    OpenDevice(#[source] std::io::Error),
    /// The simulator at the given address could not be reached.
    #[error("failed to connect to TPM simulator at {0}")]
    ConnectMssim(String, #[source] std::io::Error),
    /// The in-process simulator configuration was rejected.
    #[error("invalid simulator configuration")]
    Simulator(#[source] SimulatorConfigError),
}

/// Open the transport described by `config`.
pub fn open_transport(
    config: &Tpm12TransportConfig,
) -> Result<Box<dyn Tpm12Transport + Send>, OpenTransportError> {
    let transport: Box<dyn Tpm12Transport + Send> = match config {
        Tpm12TransportConfig::Device { path } => {
            tracing::info!(path = %path.display(), "opening TPM device");
            Box::new(DeviceTransport::open(path).map_err(OpenTransportError::OpenDevice)?)
        }
        Tpm12TransportConfig::Mssim {
            host,
            port,
            timeout_ms,
        } => {
            let addr = if host.contains(':') {
                format!("[{host}]:{port}")
            } else {
                format!("{host}:{port}")
            };
            tracing::info!(%addr, "connecting to TPM simulator");
            let transport =
                MssimTransport::connect((host.as_str(), *port), Duration::from_millis(*timeout_ms))
                    .map_err(|err| OpenTransportError::ConnectMssim(addr, err))?;
            Box::new(transport)
        }
        Tpm12TransportConfig::Simulator(config) => {
            tracing::info!("using in-process TPM simulator");
            Box::new(Tpm12Simulator::new(config).map_err(OpenTransportError::Simulator)?)
        }
    };

    Ok(transport)
}

/// A transport shared between callers, serializing their exchanges.
///
/// Each [`Tpm12Transport::submit`] holds the lock for one full
/// command/response exchange, so callers never interleave on the device.
pub struct SharedTransport<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> SharedTransport<T> {
    /// Wrap `transport` so that clones of the result share it.
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(transport)),
        }
    }
}

impl<T> Clone for SharedTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Tpm12Transport> Tpm12Transport for SharedTransport<T> {
    fn submit(&mut self, command: &[u8], reply: &mut [u8]) -> Result<usize, Tpm12Error> {
        self.inner.lock().submit(command, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tpm12CommandHelper;

    #[test]
    fn test_config_from_json() {
        let config: Tpm12TransportConfig = serde_json::from_str(r#"{ "kind": "device" }"#).unwrap();
        assert_eq!(
            config,
            Tpm12TransportConfig::Device {
                path: "/dev/tpm0".into()
            }
        );
        assert_eq!(config, Tpm12TransportConfig::default());

        let config: Tpm12TransportConfig =
            serde_json::from_str(r#"{ "kind": "mssim", "port": 2400 }"#).unwrap();
        assert_eq!(
            config,
            Tpm12TransportConfig::Mssim {
                host: "localhost".into(),
                port: 2400,
                timeout_ms: 5000,
            }
        );

        let config: Tpm12TransportConfig = serde_json::from_str(
            r#"{ "kind": "simulator", "permanent_flags": ["ownership"], "pcr_count": 16 }"#,
        )
        .unwrap();
        let Tpm12TransportConfig::Simulator(simulator) = config else {
            panic!("expected simulator config");
        };
        assert_eq!(simulator.permanent_flags, ["ownership"]);
        assert_eq!(simulator.pcr_count, 16);

        assert!(serde_json::from_str::<Tpm12TransportConfig>(r#"{ "kind": "tbs" }"#).is_err());
        assert!(serde_json::from_str::<Tpm12TransportConfig>(r#"{ "path": "/dev/tpm0" }"#).is_err());
    }

    #[test]
    fn test_open_simulator() {
        let config = Tpm12TransportConfig::Simulator(Tpm12SimulatorConfig {
            volatile_flags: vec!["global_lock".into()],
            ..Default::default()
        });
        let mut helper = Tpm12CommandHelper::new(open_transport(&config).unwrap());
        let volatile = helper.get_capability_flag_volatile().unwrap();
        assert_eq!(volatile.global_lock, 1);
    }

    #[test]
    fn test_open_errors() {
        let config = Tpm12TransportConfig::Device {
            path: "/nonexistent/tpm0".into(),
        };
        assert!(matches!(
            open_transport(&config),
            Err(OpenTransportError::OpenDevice(_))
        ));

        let config = Tpm12TransportConfig::Simulator(Tpm12SimulatorConfig {
            permanent_flags: vec!["bogus".into()],
            ..Default::default()
        });
        assert!(matches!(
            open_transport(&config),
            Err(OpenTransportError::Simulator(_))
        ));
    }

    #[test]
    fn test_open_mssim_ipv6_literal() {
        // Hosts without IPv6 loopback have nothing to connect to.
        let Ok(listener) = std::net::TcpListener::bind("[::1]:0") else {
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let config = Tpm12TransportConfig::Mssim {
            host: "::1".into(),
            port,
            timeout_ms: 1000,
        };
        assert!(open_transport(&config).is_ok());

        let config = Tpm12TransportConfig::Mssim {
            host: "::1".into(),
            port: 0,
            timeout_ms: 1000,
        };
        let Err(OpenTransportError::ConnectMssim(addr, _)) = open_transport(&config) else {
            panic!("expected connection failure");
        };
        assert_eq!(addr, "[::1]:0");
    }

    #[test]
    fn test_shared_transport() {
        let simulator = Tpm12Simulator::new(&Tpm12SimulatorConfig::default()).unwrap();
        let shared = SharedTransport::new(simulator);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mut helper = Tpm12CommandHelper::new(shared.clone());
                std::thread::spawn(move || {
                    for _ in 0..16 {
                        assert_eq!(helper.get_capability_pcr_count().unwrap(), 24);
                        let permanent = helper.get_capability_flag_permanent().unwrap();
                        assert_eq!(permanent.tag.get(), 0x001f);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
    }
}
