use futures::{SinkExt as _, StreamExt as _};
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::gateway::Gateway;
use crate::modbus::{self, ModbusTCPCodec, Operation, Request, Response, ResponseKind};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no Modbus TCP address was given, use `--tcp`")]
    NoTcpAddress,
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("the connection was closed by the gateway")]
    Closed,
    #[error("no response within {0}")]
    Timeout(humantime::Duration),
    #[error("the device remained busy after {0} attempts")]
    ServerBusy(usize),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    #[clap(flatten)]
    pub how: ConnectionGroup,

    /// If the response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "1s")]
    pub read_timeout: humantime::Duration,

    /// Retry requests that time out or are refused with a "server busy" exception this many
    /// times before giving up.
    ///
    /// A timed out request also causes the connection to be re-established.
    #[arg(long, default_value = "2")]
    pub retries: usize,

    /// The amount of additional time to wait after receiving a server busy exception.
    ///
    /// When busy, Modbus gateways respond with an exception code 6. Give the device this amount
    /// of time to finish its current work before retrying.
    #[arg(long, default_value = "25ms")]
    pub server_busy_retry_delay: humantime::Duration,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(required = true)]
pub struct ConnectionGroup {
    /// Connect to the Airzone bus over Modbus TCP (e.g. `192.168.1.20:502`).
    #[arg(long)]
    pub tcp: Option<String>,
    /// Connect to the HTTP local API of an Airzone webserver (e.g. `192.168.1.21:3000`).
    #[arg(long)]
    pub local_api: Option<String>,
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

/// A [`Gateway`] speaking Modbus TCP to a single host.
///
/// Requests are serialized: at most one is in flight at a time. The connection is established
/// lazily and dropped whenever a request fails, so that the next request reconnects.
pub struct TcpGateway {
    address: String,
    args: Args,
    io: tokio::sync::Mutex<Option<TcpIo>>,
    transaction_id_generator: AtomicU16,
}

impl TcpGateway {
    pub fn new(args: Args) -> Result<Self, Error> {
        let address = args.how.tcp.clone().ok_or(Error::NoTcpAddress)?;
        Ok(Self {
            address,
            args,
            io: tokio::sync::Mutex::new(None),
            transaction_id_generator: AtomicU16::new(0),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<TcpIo, Error> {
        let address = &self.address;
        info!(message = "connecting...", address);
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = TcpStream::connect(&*addresses)
            .await
            .map_err(|e| Error::Connect(e, address.to_string()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        Ok(Framed::new(socket, ModbusTCPCodec {}))
    }

    /// Send a request and wait for the matching response. `Ok(None)` on timeout.
    async fn transact(&self, io: &mut TcpIo, request: Request) -> Result<Option<Response>, Error> {
        io.send(request).await.map_err(Error::Send)?;
        let deadline = Instant::now() + *self.args.read_timeout;
        loop {
            match tokio::time::timeout_at(deadline, io.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(Error::Closed),
                Ok(Some(Err(e))) => return Err(Error::Receive(e)),
                Ok(Some(Ok(response))) if response.transaction_id == request.transaction_id => {
                    trace!(message = "decoded a response", transaction = response.transaction_id);
                    return Ok(Some(response));
                }
                Ok(Some(Ok(response))) => {
                    debug!(
                        message = "a response we were not expecting",
                        transaction = response.transaction_id
                    );
                }
            }
        }
    }

    /// Send the operation, retrying timeouts and `Server Busy` exceptions.
    pub async fn send_retrying(
        &self,
        device_id: u8,
        operation: Operation,
    ) -> Result<Response, Error> {
        let mut guard = self.io.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut io = match guard.take() {
                Some(io) => io,
                None => self.connect().await?,
            };
            let transaction_id = self.new_transaction_id();
            let request = Request { device_id, transaction_id, operation };
            match self.transact(&mut io, request).await {
                Ok(Some(response)) if response.is_server_busy() => {
                    *guard = Some(io);
                    if attempt > self.args.retries {
                        return Err(Error::ServerBusy(attempt));
                    }
                    debug!(message = "server busy, will retry", transaction_id, attempt);
                    tokio::time::sleep(*self.args.server_busy_retry_delay).await;
                }
                Ok(Some(response)) => {
                    *guard = Some(io);
                    return Ok(response);
                }
                Ok(None) => {
                    if attempt > self.args.retries {
                        return Err(Error::Timeout(self.args.read_timeout));
                    }
                    debug!(message = "request timed out, will reconnect", transaction_id, attempt);
                }
                Err(e) => {
                    if attempt > self.args.retries {
                        return Err(e);
                    }
                    warn!(
                        message = "request failed, will reconnect",
                        error = (&e as &dyn std::error::Error)
                    );
                }
            }
        }
    }

    async fn read(&self, device_id: u8, operation: Operation, count: u16) -> Option<Vec<u16>> {
        if count > modbus::MAX_READ_COUNT {
            warn!(message = "refusing to read this many registers at once", count);
            return None;
        }
        match self.send_retrying(device_id, operation).await {
            Ok(Response { kind: ResponseKind::Registers { values }, .. }) => {
                if values.len() != usize::from(count) {
                    warn!(message = "short read", requested = count, received = values.len());
                    return None;
                }
                Some(values)
            }
            Ok(Response { kind: ResponseKind::ErrorCode(code), .. }) => {
                warn!(message = "device responded with an exception", device_id, code, ?operation);
                None
            }
            Ok(response) => {
                warn!(message = "unexpected response kind", ?response.kind);
                None
            }
            Err(e) => {
                warn!(
                    message = "reading registers failed",
                    device_id,
                    ?operation,
                    error = (&e as &dyn std::error::Error)
                );
                None
            }
        }
    }
}

impl std::fmt::Display for TcpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

impl Gateway for TcpGateway {
    async fn read_holding_registers(
        &self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Option<Vec<u16>> {
        self.read(device_id, Operation::ReadHoldingRegisters { address, count }, count).await
    }

    async fn read_input_registers(
        &self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Option<Vec<u16>> {
        self.read(device_id, Operation::ReadInputRegisters { address, count }, count).await
    }

    async fn write_single_register(&self, device_id: u8, address: u16, value: u16) -> Option<()> {
        let operation = Operation::WriteSingleRegister { address, value };
        match self.send_retrying(device_id, operation).await {
            Ok(Response { kind: ResponseKind::WriteSingle { address: a, value: v }, .. })
                if (a, v) == (address, value) =>
            {
                Some(())
            }
            Ok(Response { kind: ResponseKind::WriteSingle { address: a, value: v }, .. }) => {
                warn!(
                    message = "write echo does not match the request",
                    device_id,
                    address,
                    value,
                    echoed_address = a,
                    echoed_value = v
                );
                None
            }
            Ok(response) => {
                warn!(message = "write was not acknowledged", device_id, address, ?response.kind);
                None
            }
            Err(e) => {
                warn!(
                    message = "writing register failed",
                    device_id,
                    address,
                    error = (&e as &dyn std::error::Error)
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[derive(clap::Parser)]
    struct Cli {
        #[clap(flatten)]
        connection: Args,
    }

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["test"];
        argv.extend_from_slice(extra);
        Cli::parse_from(argv).connection
    }

    #[test]
    fn requires_a_connection() {
        assert!(Cli::try_parse_from(["test"]).is_err());
        let args = args(&["--tcp", "localhost:502"]);
        assert_eq!(*args.read_timeout, std::time::Duration::from_secs(1));
        assert_eq!(args.retries, 2);
    }

    #[test]
    fn local_api_is_not_a_tcp_gateway() {
        let args = args(&["--local-api", "localhost:3000"]);
        assert!(matches!(TcpGateway::new(args), Err(Error::NoTcpAddress)));
    }

    /// Serve one connection, answering each request with the registers `[address, count]`.
    async fn serve(listener: tokio::net::TcpListener, busy_first: bool) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut busy = busy_first;
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            let mut response = request[..2].to_vec();
            if busy {
                busy = false;
                response.extend([0, 0, 0, 3, request[6], request[7] | 0x80, 6]);
            } else {
                response.extend([0, 0, 0, 7, request[6], request[7], 4]);
                response.extend(&request[8..12]);
            }
            socket.write_all(&response).await.unwrap();
        }
    }

    #[tokio::test]
    async fn reads_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, true));
        let gateway = TcpGateway::new(args(&["--tcp", &address])).unwrap();
        assert_eq!(gateway.read_input_registers(1, 256, 2).await, Some(vec![256, 2]));
        assert_eq!(gateway.read_holding_registers(1, 9, 2).await, Some(vec![9, 2]));
    }

    /// Serve one connection, echoing each write with `skew` added to the value.
    async fn serve_writes(listener: tokio::net::TcpListener, skew: u16) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            let value = u16::from_be_bytes([request[10], request[11]]).wrapping_add(skew);
            let mut response = request[..10].to_vec();
            response.extend(value.to_be_bytes());
            socket.write_all(&response).await.unwrap();
        }
    }

    #[tokio::test]
    async fn writes_are_acknowledged_by_their_echo() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_writes(listener, 0));
        let gateway = TcpGateway::new(args(&["--tcp", &address])).unwrap();
        assert_eq!(gateway.to_string(), address);
        assert_eq!(gateway.write_single_register(1, 515, 240).await, Some(()));
    }

    #[tokio::test]
    async fn mismatched_write_echo_is_not_an_acknowledgement() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_writes(listener, 1));
        let gateway = TcpGateway::new(args(&["--tcp", &address])).unwrap();
        assert_eq!(gateway.write_single_register(1, 515, 240).await, None);
    }

    #[tokio::test]
    async fn short_reads_are_no_data() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, false));
        let gateway = TcpGateway::new(args(&["--tcp", &address])).unwrap();
        assert_eq!(gateway.read_input_registers(1, 0, 21).await, None);
    }

    #[tokio::test]
    async fn unreachable_host_is_no_data() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let gateway = TcpGateway::new(args(&["--tcp", &address, "--retries", "0"])).unwrap();
        assert_eq!(gateway.read_input_registers(1, 0, 21).await, None);
        assert_eq!(gateway.write_single_register(1, 0, 1).await, None);
    }
}
