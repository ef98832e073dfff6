use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold::{
    ClientId, Config, DhcpServer, JournalFile, Lease, LeaseStore, Result, SystemClock,
};

#[derive(Parser)]
#[command(name = "leasehold")]
#[command(author, version, about = "A concurrent DHCPv4 lease server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on port 67 (the default)
    Run,
    ShowConfig,
    ListLeases,
    /// End the lease, offer or quarantine on an address
    ForceExpire { address: Ipv4Addr },
    /// Withhold an address from dynamic allocation
    Reserve {
        address: Ipv4Addr,
        /// Client identifier or MAC the address is kept for
        #[arg(long)]
        client: Option<String>,
    },
    Unreserve { address: Ipv4Addr },
    /// Rewrite the lease journal to its current state
    CompactLeases,
}

/// Loads the leases without writing to the journal.
async fn read_store(config: Config) -> Result<LeaseStore> {
    let backend = Arc::new(JournalFile::new(&config.leases_file));
    LeaseStore::open(Arc::new(config), Arc::new(SystemClock), backend).await
}

/// Loads the leases for a change. Refused while a server holds the journal,
/// since its in-memory table would not see the change.
async fn lock_store(config: Config) -> Result<LeaseStore> {
    let backend = Arc::new(JournalFile::open_exclusive(&config.leases_file)?);
    LeaseStore::open(Arc::new(config), Arc::new(SystemClock), backend).await
}

fn print_lease(lease: &Lease) {
    let client = lease
        .client_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    let expires = lease
        .lease_end
        .map(|end| end.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());
    let remaining = lease.remaining_seconds();
    let remaining_str = if lease.lease_end.is_none() {
        "-".to_string()
    } else if remaining > 0 {
        format!("{}s", remaining)
    } else {
        "expired".to_string()
    };

    println!(
        "{:<16} {:<24} {:<10} {:<24} {:<10}",
        lease.address, client, lease.state, expires, remaining_str
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = DhcpServer::new(config).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    if let Err(error) = server.shutdown().await {
                        tracing::error!("Failed to compact leases on shutdown: {}", error);
                    }
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let store = read_store(config).await?;
            let leases = store.list().await;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<16} {:<24} {:<10} {:<24} {:<10}",
                    "IP Address", "Client ID", "State", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(88));

                for lease in &leases {
                    print_lease(lease);
                }
            }

            Ok(())
        }
        Commands::ForceExpire { address } => {
            let store = lock_store(config).await?;
            let lease = store.force_expire(address).await?;
            println!("Expired {} ({}).", address, lease.state);
            Ok(())
        }
        Commands::Reserve { address, client } => {
            let client_id = client.as_deref().map(ClientId::from_mac_or_hex).transpose()?;
            let store = lock_store(config).await?;
            store.reserve(address, client_id).await?;
            match client {
                Some(client) => println!("Reserved {} for {}.", address, client),
                None => println!("Reserved {}.", address),
            }
            Ok(())
        }
        Commands::Unreserve { address } => {
            let store = lock_store(config).await?;
            store.unreserve(address).await?;
            println!("Released reservation on {}.", address);
            Ok(())
        }
        Commands::CompactLeases => {
            let store = lock_store(config).await?;
            store.compact().await?;
            println!("Compacted lease journal ({} entries).", store.list().await.len());
            Ok(())
        }
    }
}
