//! Modbus TCP client for battery and inverter bridges
//!
//! One bridge is one TCP endpoint (a gateway or a device with a built-in
//! Modbus server). Several devices may sit behind the same bridge and are
//! addressed by unit id, so the client switches the slave id per request.

use crate::config::BridgeConfig;
use crate::error::{Result, VoltaicError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

pub mod modbus_like;

pub use modbus_like::ModbusLike;

/// One register-level request
#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    Read { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, values: &'a [u16] },
}

impl Request<'_> {
    const fn is_write(&self) -> bool {
        !matches!(self, Self::Read { .. })
    }

    fn describe(&self) -> String {
        match self {
            Self::Read { address, count } => {
                format!("read of {} registers at {}", count, address)
            }
            Self::WriteSingle { address, value } => {
                format!("write of {} to register {}", value, address)
            }
            Self::WriteMultiple { address, values } => {
                format!("write of {} registers at {}", values.len(), address)
            }
        }
    }
}

/// Modbus TCP client for one bridge
pub struct ModbusClient {
    /// Modbus TCP client connection
    client: Option<tokio_modbus::client::Context>,

    /// "ip:port"
    address: String,

    /// Connection timeout
    connection_timeout: Duration,

    /// Operation timeout
    operation_timeout: Duration,

    /// Logger
    logger: StructuredLogger,
}

impl ModbusClient {
    /// Create a new Modbus client
    pub fn new(config: &BridgeConfig) -> Self {
        let logger = get_logger_with_context(LogContext::new("modbus").with_bridge_id(&config.id));
        Self {
            client: None,
            address: format!("{}:{}", config.ip, config.port),
            connection_timeout: Duration::from_millis(config.connect_timeout_ms),
            operation_timeout: Duration::from_millis(config.io_timeout_ms),
            logger,
        }
    }

    /// Connect to the Modbus server
    pub async fn connect(&mut self) -> Result<()> {
        self.logger
            .info(&format!("Connecting to Modbus server at {}", self.address));

        let socket_addr: std::net::SocketAddr = self
            .address
            .parse()
            .map_err(|e| VoltaicError::configuration(format!("Invalid socket address: {}", e)))?;

        match timeout(self.connection_timeout, tcp::connect(socket_addr)).await {
            Ok(Ok(client)) => {
                self.client = Some(client);
                self.logger.info("Successfully connected to Modbus server");
                Ok(())
            }
            Ok(Err(e)) => Err(VoltaicError::communication(format!(
                "Failed to connect to Modbus server {}: {}",
                self.address, e
            ))),
            Err(_) => Err(VoltaicError::timeout(format!(
                "Connection to {} timed out",
                self.address
            ))),
        }
    }

    /// Disconnect from the Modbus server
    pub fn disconnect(&mut self) {
        if self.client.take().is_some() {
            self.logger.info("Disconnecting from Modbus server");
        }
    }

    /// Check if connected
    pub const fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn execute(&mut self, slave_id: u8, request: Request<'_>) -> Result<Vec<u16>> {
        let timeout_duration = self.operation_timeout;
        self.logger
            .trace(&format!("Slave {}: {}", slave_id, request.describe()));

        let client = self.get_client()?;
        client.set_slave(Slave(slave_id));

        let outcome = match request {
            Request::Read { address, count } => {
                timeout(timeout_duration, client.read_holding_registers(address, count)).await
            }
            Request::WriteSingle { address, value } => {
                timeout(timeout_duration, client.write_single_register(address, value))
                    .await
                    .map(|r| r.map(|r| r.map(|()| Vec::new())))
            }
            Request::WriteMultiple { address, values } => {
                timeout(timeout_duration, client.write_multiple_registers(address, values))
                    .await
                    .map(|r| r.map(|r| r.map(|()| Vec::new())))
            }
        };

        match outcome {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(VoltaicError::modbus(format!(
                "Slave {} rejected {}: {:?}",
                slave_id,
                request.describe(),
                exception
            ))),
            Ok(Err(e)) => Err(VoltaicError::communication(format!(
                "{} failed: {}",
                request.describe(),
                e
            ))),
            Err(_) => Err(VoltaicError::timeout(format!(
                "{} timed out",
                request.describe()
            ))),
        }
    }

    /// Get client reference or error if not connected
    fn get_client(&mut self) -> Result<&mut tokio_modbus::client::Context> {
        self.client
            .as_mut()
            .ok_or_else(|| VoltaicError::communication("Not connected to Modbus server"))
    }
}

/// Connection manager with automatic reconnection
pub struct ModbusConnectionManager {
    client: ModbusClient,
    max_retry_attempts: u32,
    retry_delay: Duration,
    logger: StructuredLogger,
}

impl ModbusConnectionManager {
    /// Create a new connection manager
    pub fn new(config: &BridgeConfig) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("modbus_manager").with_bridge_id(&config.id),
        );
        Self {
            client: ModbusClient::new(config),
            max_retry_attempts: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            logger,
        }
    }

    /// Execute a request, reconnecting on connection errors.
    ///
    /// Reads are retried on a fresh connection. A write is sent at most once:
    /// once its frame may have left, a failure is returned to the caller.
    async fn execute_with_reconnect(&mut self, slave_id: u8, request: Request<'_>) -> Result<Vec<u16>> {
        let mut attempts = 0;

        loop {
            if !self.client.is_connected()
                && let Err(e) = self.client.connect().await
            {
                attempts += 1;
                if !Self::is_connection_error(&e) || attempts >= self.max_retry_attempts {
                    return Err(e);
                }
                self.logger
                    .debug(&format!("Connection attempt {} failed: {}", attempts, e));
                sleep(self.retry_delay).await;
                continue;
            }

            match self.client.execute(slave_id, request).await {
                Ok(words) => return Ok(words),
                Err(e) if Self::is_connection_error(&e) => {
                    self.logger
                        .debug(&format!("Request failed due to connection error: {}", e));
                    self.client.disconnect();
                    attempts += 1;
                    if request.is_write() || attempts >= self.max_retry_attempts {
                        return Err(e);
                    }
                    sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Errors after which the socket is no longer trusted
    const fn is_connection_error(error: &VoltaicError) -> bool {
        matches!(
            error,
            VoltaicError::Communication { .. } | VoltaicError::Timeout { .. }
        )
    }
}

#[async_trait::async_trait]
impl ModbusLike for ModbusConnectionManager {
    async fn read_holding_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.execute_with_reconnect(slave_id, Request::Read { address, count })
            .await
    }

    async fn write_single_register(&mut self, slave_id: u8, address: u16, value: u16) -> Result<()> {
        self.execute_with_reconnect(slave_id, Request::WriteSingle { address, value })
            .await
            .map(|_| ())
    }

    async fn write_multiple_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        self.execute_with_reconnect(slave_id, Request::WriteMultiple { address, values })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_modbus_client_creation() {
        let config = BridgeConfig::default();
        let client = ModbusClient::new(&config);
        assert!(!client.is_connected());
        assert_eq!(client.address, "192.168.1.100:502");
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(ModbusConnectionManager::is_connection_error(
            &VoltaicError::timeout("t")
        ));
        assert!(ModbusConnectionManager::is_connection_error(
            &VoltaicError::communication("c")
        ));
        assert!(!ModbusConnectionManager::is_connection_error(
            &VoltaicError::modbus("illegal data address")
        ));
    }

    /// Peer that accepts connections, never answers and counts received bytes
    async fn silent_peer() -> (u16, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    loop {
                        if stream.readable().await.is_err() {
                            break;
                        }
                        match stream.try_read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                counter.fetch_add(n, Ordering::SeqCst);
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(_) => break,
                        }
                    }
                });
            }
        });
        (port, received)
    }

    fn bridge(port: u16) -> BridgeConfig {
        BridgeConfig {
            ip: "127.0.0.1".to_string(),
            port,
            io_timeout_ms: 100,
            max_retries: 3,
            retry_delay_ms: 0,
            ..BridgeConfig::default()
        }
    }

    // MBAP header plus a five byte PDU, for both FC3 and FC6 requests
    const FRAME_LEN: usize = 12;

    #[tokio::test]
    async fn test_timed_out_write_is_sent_once() {
        let (port, received) = silent_peer().await;
        let mut manager = ModbusConnectionManager::new(&bridge(port));
        let err = manager
            .write_single_register(1, 0x2010, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, VoltaicError::Timeout { .. }));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), FRAME_LEN);
        assert!(!manager.client.is_connected());
    }

    #[tokio::test]
    async fn test_timed_out_read_is_retried() {
        let (port, received) = silent_peer().await;
        let mut manager = ModbusConnectionManager::new(&bridge(port));
        assert!(manager.read_holding_registers(1, 40071, 1).await.is_err());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(received.load(Ordering::SeqCst), 3 * FRAME_LEN);
    }

    #[tokio::test]
    async fn test_invalid_address_is_not_retried() {
        let config = BridgeConfig {
            ip: "not an ip".to_string(),
            retry_delay_ms: 0,
            ..BridgeConfig::default()
        };
        let mut manager = ModbusConnectionManager::new(&config);
        let err = manager.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, VoltaicError::Configuration { .. }));
        assert!(!manager.client.is_connected());
    }
}
