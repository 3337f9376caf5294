//! UDP socket bind/recv and TUN device I/O: the "external collaborators"
//! `noiseguard-core` deliberately doesn't own (spec §1). Thin by design —
//! this crate's only job is to satisfy `noiseguard_core::DatapathIo` with a
//! real socket and hand raw TUN frames to `Device::send_outbound`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use noiseguard_core::{DatapathIo, Device, Family, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// 16-byte aligned receive buffer, matching the teacher's `tun.rs` demo.
/// MTU is assumed to stay near 1500, so 2048 bytes is headroom enough.
#[repr(align(16))]
struct AlignedPacket([u8; 2048]);

/// [`DatapathIo`] backed by one or two UDP sockets. `inject_l3` hands
/// decrypted plaintext to a bounded channel instead of writing the TUN
/// device directly, since the trait's methods are sync but TUN writes are
/// async — the channel is drained by [`run_inject_loop`].
pub struct TunIo {
    v4: Arc<UdpSocket>,
    v6: Option<Arc<UdpSocket>>,
    inject_tx: flume::Sender<Vec<u8>>,
}

impl TunIo {
    pub async fn bind(
        v4_addr: SocketAddr,
        v6_addr: Option<SocketAddr>,
    ) -> std::io::Result<(Arc<Self>, flume::Receiver<Vec<u8>>)> {
        let v4 = Arc::new(UdpSocket::bind(v4_addr).await?);
        let v6 = match v6_addr {
            Some(addr) => Some(Arc::new(UdpSocket::bind(addr).await?)),
            None => None,
        };
        let (inject_tx, inject_rx) = flume::bounded(1024);
        Ok((Arc::new(Self { v4, v6, inject_tx }), inject_rx))
    }

    pub fn v4_socket(&self) -> Arc<UdpSocket> {
        self.v4.clone()
    }

    pub fn v6_socket(&self) -> Option<Arc<UdpSocket>> {
        self.v6.clone()
    }

    /// Best-effort `SO_MARK` mirror of the interface's `fwmark` config
    /// (SPEC_FULL "Socket option mirroring"). Linux-only; a no-op
    /// elsewhere, matching the original's own platform split.
    #[cfg(target_os = "linux")]
    pub fn set_fwmark(&self, mark: u32) -> std::io::Result<()> {
        use socket2::SockRef;
        SockRef::from(&*self.v4).set_mark(mark)?;
        if let Some(v6) = &self.v6 {
            SockRef::from(&**v6).set_mark(mark)?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_fwmark(&self, _mark: u32) -> std::io::Result<()> {
        Ok(())
    }
}

impl DatapathIo for TunIo {
    fn send_datagram(&self, family: Family, addr: SocketAddr, buf: &[u8]) -> bool {
        let sock: &UdpSocket = match family {
            Family::V4 => &self.v4,
            Family::V6 => self.v6.as_deref().unwrap_or(&self.v4),
        };
        match sock.try_send_to(buf, addr) {
            Ok(_) => true,
            Err(e) => {
                debug!(?e, "send_datagram failed");
                false
            }
        }
    }

    fn inject_l3(&self, _peer: PeerId, buf: &[u8]) {
        if self.inject_tx.try_send(buf.to_vec()).is_err() {
            warn!("tun injection queue full, dropping a decrypted packet");
        }
    }
}

/// Drains one UDP socket's recv loop, handing every datagram to `device`.
/// Run one of these per bound socket (one for v4, one for v6 if present).
pub async fn run_udp_recv_loop<IO: DatapathIo>(socket: Arc<UdpSocket>, device: Arc<Device<IO>>) {
    let mut buf: Box<AlignedPacket> = Box::new(AlignedPacket([0; 2048]));
    loop {
        match socket.recv_from(&mut buf.0).await {
            Ok((n, addr)) => {
                if let Err(drop_reason) = device.recv_datagram(addr, buf.0[..n].to_vec()) {
                    debug!(?drop_reason, %addr, "inbound datagram dropped");
                }
            }
            Err(e) => warn!(?e, "udp recv error"),
        }
    }
}

/// Reads raw IP packets off the TUN device and routes each one through
/// `Device::send_outbound` by destination address (spec §4.4 outbound
/// step 1). `dev` is any `AsyncRead` TUN handle, e.g. `tun::AsyncDevice`.
pub async fn run_tun_read_loop<IO, R>(mut dev: R, device: Arc<Device<IO>>)
where
    IO: DatapathIo,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 2048];
    loop {
        let n = match dev.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!(?e, "tun read error");
                return;
            }
        };
        let Some(dest) = parse_inner_dest(&buf[..n]) else {
            continue;
        };
        if let Err(drop_reason) = device.send_outbound(dest, buf[..n].to_vec()) {
            debug!(?drop_reason, %dest, "outbound packet dropped");
        }
    }
}

/// Drains [`TunIo::inject_l3`]'s channel and writes decrypted plaintext
/// back out the TUN device.
pub async fn run_inject_loop<W>(mut dev: W, inject_rx: flume::Receiver<Vec<u8>>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Ok(buf) = inject_rx.recv_async().await {
        if let Err(e) = dev.write_all(&buf).await {
            warn!(?e, "tun write error");
            return;
        }
    }
}

/// Drives `Device::tick_timers` once a second, the cadence the teacher's
/// demo binary uses for its own `tokio::time::interval`.
pub async fn run_timer_loop<IO: DatapathIo>(device: Arc<Device<IO>>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tick.tick().await;
        device.tick_timers();
    }
}

/// Reads the destination address out of a raw IPv4/IPv6 header by the
/// version nibble, the same manual parse `noiseguard-core`'s decrypt
/// worker uses for the source address — kept dependency-free rather than
/// pulling in a packet-parsing crate for four bytes.
fn parse_inner_dest(buf: &[u8]) -> Option<IpAddr> {
    if buf.is_empty() {
        return None;
    }
    match buf[0] >> 4 {
        4 if buf.len() >= 20 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[16..20]);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if buf.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_destination() {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf[16..20].copy_from_slice(&[10, 0, 0, 7]);
        assert_eq!(parse_inner_dest(&buf), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
    }

    #[test]
    fn rejects_truncated_header() {
        let buf = vec![0x45u8; 10];
        assert_eq!(parse_inner_dest(&buf), None);
    }

    #[test]
    fn rejects_unknown_version() {
        let buf = vec![0x00u8; 20];
        assert_eq!(parse_inner_dest(&buf), None);
    }
}
