use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::allocator::probe_from_config;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::persist::JournalFile;
use crate::scheduler::Scheduler;
use crate::store::LeaseStore;
use crate::transaction::{DHCP_SERVER_PORT, TransactionEngine};

const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    engine: Arc<TransactionEngine>,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let backend = Arc::new(JournalFile::open_exclusive(&config.leases_file)?);
        let store = Arc::new(
            LeaseStore::open(Arc::clone(&config), Arc::new(SystemClock), backend).await?,
        );
        if let Err(error) = store.compact().await {
            warn!("Could not compact lease journal at startup: {}", error);
        }
        let engine = Arc::new(TransactionEngine::new(
            store,
            probe_from_config(&config.conflict_probe),
        )?);

        let socket = Arc::new(Self::create_socket(&config)?);

        info!(
            "DHCP server starting on {}:{}",
            config.server_ip, DHCP_SERVER_PORT
        );
        info!(
            "IP pool: {} - {} ({} addresses, {} excluded)",
            config.pool_start,
            config.pool_end,
            config.pool_size(),
            config.excluded_addresses.len()
        );

        Ok(Self { engine, socket })
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        if let Some(interface_index) = config.interface_index {
            #[cfg(windows)]
            {
                use std::os::windows::io::AsRawSocket;
                let raw_socket = socket.as_raw_socket();

                let result = set_interface_index(raw_socket, interface_index);
                if let Err(error) = result {
                    warn!(
                        "Failed to set interface index {}: {}",
                        interface_index, error
                    );
                }
            }
            #[cfg(not(windows))]
            {
                warn!(
                    "interface_index ({}) is only supported on Windows and will be ignored",
                    interface_index
                );
            }
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(tokio_socket)
    }

    /// Serves requests and drives lease timers until the future is dropped.
    pub async fn run(&self) -> Result<()> {
        let scheduler = Scheduler::from_config(Arc::clone(self.engine.store()));

        tokio::select! {
            () = scheduler.run() => Ok(()),
            result = self.serve() => result,
        }
    }

    async fn serve(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let engine = Arc::clone(&self.engine);
                    let socket = Arc::clone(&self.socket);

                    tokio::spawn(async move {
                        let Some(reply) = engine.handle(&data, source).await else {
                            return;
                        };
                        if let Err(error) = socket
                            .send_to(&reply.packet.encode(), reply.destination)
                            .await
                        {
                            warn!("Error sending reply to {}: {}", reply.destination, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }

    /// Compacts the lease journal; call once the server has stopped serving.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.store().compact().await
    }

    pub fn config(&self) -> &Config {
        self.engine.config()
    }

    pub fn store(&self) -> &LeaseStore {
        self.engine.store()
    }
}

#[cfg(windows)]
fn set_interface_index(raw_socket: std::os::windows::io::RawSocket, index: u32) -> Result<()> {
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, SOCKET, setsockopt};

    const IP_UNICAST_IF: i32 = 31;

    let index_bytes = index.to_be_bytes();
    let result = unsafe {
        setsockopt(
            raw_socket as SOCKET,
            IPPROTO_IP,
            IP_UNICAST_IF,
            index_bytes.as_ptr(),
            std::mem::size_of::<u32>() as i32,
        )
    };

    if result != 0 {
        return Err(Error::Socket(format!(
            "setsockopt IP_UNICAST_IF failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}
