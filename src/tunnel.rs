use log::{debug, info, warn};
use std::{error, fmt, io, net::Ipv4Addr, process::ExitStatus};
use tokio::{fs, process::Command, signal};

use crate::ikev1::{Handoff, ModeConfig};

const SCRIPT_VARIABLES: [&str; 8] = [
    "TUNDEV",
    "VPNGATEWAY",
    "INTERNAL_IP4_ADDRESS",
    "INTERNAL_IP4_NETMASK",
    "INTERNAL_IP4_DNS",
    "INTERNAL_IP4_NBNS",
    "CISCO_DEF_DOMAIN",
    "CISCO_BANNER",
];

/// Holds an established IPsec SA until the process is interrupted.
pub struct Tunnel {
    handoff: Handoff,
}

impl Tunnel {
    pub fn new(handoff: Handoff) -> Tunnel {
        Tunnel { handoff }
    }

    pub async fn run(mut self) -> Result<(), TunnelError> {
        let result = self.hold().await;
        info!("Disconnecting from {}", self.handoff.gateway());
        if let Err(err) = self.handoff.send_kill_packet().await {
            warn!("Failed to send delete notification: {}", err);
        }
        if let Some(pid_file) = self.handoff.pid_file.as_deref() {
            match fs::remove_file(pid_file).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove PID file {}: {}", pid_file, err),
            }
        }
        result
    }

    async fn hold(&self) -> Result<(), TunnelError> {
        let handoff = &self.handoff;
        if let Some(script) = handoff.script.as_deref() {
            let environment = script_environment(
                &handoff.interface_name,
                *handoff.gateway().ip(),
                &handoff.mode_config,
            );
            run_script(script, &environment).await?;
        }
        if let Some(pid_file) = handoff.pid_file.as_deref() {
            write_pid_file(pid_file).await?;
        }
        info!(
            "Tunnel {} is up, inbound SPI {:08x} outbound SPI {:08x}, {}-{}",
            handoff.interface_name,
            handoff.inbound.spi,
            handoff.outbound.spi,
            handoff.cipher,
            handoff.hash
        );
        debug!(
            "ESP peer {} with {} encapsulation, transform {} auth {}, keymat {}/{} bytes",
            handoff.esp_peer,
            handoff.encapsulation,
            handoff.cipher_id,
            handoff.hash_id,
            handoff.inbound.keymat.len(),
            handoff.outbound.keymat.len()
        );
        if let Some(socket) = handoff.esp_socket.as_ref() {
            debug!("Cisco UDP encapsulation socket is {}", socket.local_addr()?);
        }
        signal::ctrl_c().await?;
        Ok(())
    }
}

fn join_addresses(addresses: &[Ipv4Addr]) -> String {
    addresses
        .iter()
        .map(|address| address.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Variables describing the tunnel for the configuration script; absent
/// settings are left out.
pub fn script_environment(
    interface_name: &str,
    gateway: Ipv4Addr,
    mode_config: &ModeConfig,
) -> Vec<(&'static str, String)> {
    let mut environment = vec![
        ("TUNDEV", interface_name.to_string()),
        ("VPNGATEWAY", gateway.to_string()),
        ("INTERNAL_IP4_ADDRESS", mode_config.address.to_string()),
    ];
    if let Some(netmask) = mode_config.netmask {
        environment.push(("INTERNAL_IP4_NETMASK", netmask.to_string()));
    }
    if !mode_config.dns.is_empty() {
        environment.push(("INTERNAL_IP4_DNS", join_addresses(&mode_config.dns)));
    }
    if !mode_config.nbns.is_empty() {
        environment.push(("INTERNAL_IP4_NBNS", join_addresses(&mode_config.nbns)));
    }
    if let Some(domain) = mode_config.domain.as_ref() {
        environment.push(("CISCO_DEF_DOMAIN", domain.clone()));
    }
    if let Some(banner) = mode_config.banner.as_ref() {
        environment.push(("CISCO_BANNER", banner.clone()));
    }
    environment
}

async fn run_script(script: &str, environment: &[(&'static str, String)]) -> Result<(), TunnelError> {
    debug!("Running configuration script {}", script);
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(script);
    for name in SCRIPT_VARIABLES {
        command.env_remove(name);
    }
    command.envs(environment.iter().cloned());
    let status = command.status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(TunnelError::Script(status))
    }
}

async fn write_pid_file(path: &str) -> Result<(), TunnelError> {
    fs::write(path, format!("{}\n", std::process::id())).await?;
    debug!("Wrote PID file {}", path);
    Ok(())
}

pub enum TunnelError {
    Script(ExitStatus),
    Io(io::Error),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Script(status) => write!(f, "Configuration script failed: {}", status),
            Self::Io(ref e) => write!(f, "IO error: {}", e),
        }
    }
}

impl fmt::Debug for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Script(_) => None,
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> TunnelError {
        Self::Io(err)
    }
}
