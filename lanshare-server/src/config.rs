use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use lanshare_core::MESSAGE_HISTORY_LIMIT;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 500 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "lanshare-server")]
pub struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub bind_address: String,

    #[arg(long, default_value = "uploads")]
    pub upload_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    #[arg(long, default_value_t = MESSAGE_HISTORY_LIMIT)]
    pub message_history: usize,

    /// Uploaded files older than this are removed by the sweeper.
    #[arg(long, default_value_t = 3600)]
    pub file_ttl_secs: u64,

    #[arg(long, default_value_t = 600)]
    pub cleanup_interval_secs: u64,

    /// Skip the terminal QR code printed at startup.
    #[arg(long, default_value_t = false)]
    pub no_qr: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub message_history: usize,
    pub file_ttl: Duration,
    pub cleanup_interval: Duration,
    /// Port advertised by `/info`; set from the bound listener.
    pub port: u16,
}

impl ServerConfig {
    pub fn new(upload_dir: PathBuf) -> Self {
        Self {
            upload_dir,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            message_history: MESSAGE_HISTORY_LIMIT,
            file_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(600),
            port: 5000,
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            upload_dir: args.upload_dir.clone(),
            max_upload_bytes: args.max_upload_bytes,
            message_history: args.message_history.max(1),
            file_ttl: Duration::from_secs(args.file_ttl_secs),
            cleanup_interval: Duration::from_secs(args.cleanup_interval_secs.max(1)),
            port: args
                .bind_address
                .parse::<SocketAddr>()
                .map(|addr| addr.port())
                .unwrap_or(5000),
        }
    }
}

/// Address other devices on the LAN should use to reach this host.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which interface
/// would route outward.
pub fn local_ip() -> IpAddr {
    let detect = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip())
    };
    detect().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
