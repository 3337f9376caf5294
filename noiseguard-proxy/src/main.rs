//! Userspace interface binary: reads a KDL config, brings up a
//! `noiseguard_core::Device`, and wires it to a UDP socket pair and a TUN
//! device via `noiseguard-tun`. Promoted from the teacher's single-file
//! `examples/tun.rs` demo into a standalone binary crate.

use std::net::SocketAddr;
use std::sync::Arc;

use base64ct::{Base64, Encoding};
use noiseguard_core::config::{AllowedIpConfig, InterfaceConfig, PeerConfig};
use noiseguard_core::{workers, Device};
use noiseguard_tun::TunIo;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(knuffel::Decode)]
struct ProxyConfig {
    #[knuffel(child)]
    interface: InterfaceNode,

    #[knuffel(children(name = "peer"))]
    peers: Vec<PeerNode>,
}

#[derive(knuffel::Decode)]
struct InterfaceNode {
    #[knuffel(child, name = "private-key", unwrap(argument, bytes))]
    private_key: Option<Vec<u8>>,

    #[knuffel(child, unwrap(argument))]
    listen: SocketAddr,

    #[knuffel(child, unwrap(argument, str))]
    address: ipnet::Ipv4Net,

    #[knuffel(child, unwrap(argument))]
    fwmark: Option<u32>,
}

#[derive(knuffel::Decode)]
struct PeerNode {
    #[knuffel(child, name = "public-key", unwrap(argument, bytes))]
    public_key: Vec<u8>,

    #[knuffel(children(name = "allowed-ip"), unwrap(argument, str))]
    allowed_ips: Vec<ip_network::IpNetwork>,

    #[knuffel(child, unwrap(argument))]
    endpoint: Option<SocketAddr>,

    #[knuffel(child, name = "persistent-keepalive", unwrap(argument))]
    persistent_keepalive: Option<u16>,
}

fn load_config(path: &str) -> ProxyConfig {
    let text = std::fs::read_to_string(path).expect("config file should be readable");
    knuffel::parse(path, &text).expect("config file should parse")
}

fn resolve_private_key(node: &InterfaceNode) -> StaticSecret {
    match &node.private_key {
        Some(bytes) => StaticSecret::from(<[u8; 32]>::try_from(&**bytes).expect("private key must be 32 bytes")),
        None => {
            let key = StaticSecret::random_from_rng(OsRng);
            tracing::info!(
                public_key = %Base64::encode_string(PublicKey::from(&key).as_bytes()),
                "generated a new interface keypair"
            );
            key
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "demos/proxy.kdl".to_string());
    let config = load_config(&path);

    let private_key = resolve_private_key(&config.interface);
    let listen = config.interface.listen;
    let v6_listen = matches!(listen, SocketAddr::V6(_)).then_some(listen);
    let v4_listen = if v6_listen.is_none() { listen } else { "0.0.0.0:0".parse().unwrap() };

    let (io, inject_rx) = TunIo::bind(v4_listen, v6_listen)
        .await
        .expect("failed to bind udp socket(s)");
    if let Some(mark) = config.interface.fwmark {
        io.set_fwmark(mark).expect("failed to set fwmark");
    }

    let device = Arc::new(Device::new(io.clone()));

    let peer_configs: Vec<PeerConfig> = config
        .peers
        .iter()
        .map(|p| PeerConfig {
            public_key: <[u8; 32]>::try_from(&*p.public_key).expect("peer public key must be 32 bytes"),
            preshared_key: None,
            persistent_keepalive_interval: p.persistent_keepalive,
            endpoint: p.endpoint,
            description: None,
            remove: false,
            replace_allowed_ips: false,
            allowed_ips: p
                .allowed_ips
                .iter()
                .map(|&network| AllowedIpConfig { network })
                .collect(),
        })
        .collect();

    let created = device
        .apply_config(InterfaceConfig {
            port: Some(listen.port()),
            fwmark: config.interface.fwmark,
            private_key: Some(private_key.to_bytes()),
            replace_peers: false,
            peers: peer_configs,
        })
        .expect("failed to apply initial configuration");

    workers::spawn_workers(device.clone());
    for id in created {
        workers::spawn_peer_workers(device.clone(), id);
    }

    let mut tun_config = tun::Configuration::default();
    tun_config.address(config.interface.address.addr()).netmask(config.interface.address.netmask()).up();
    let tun_dev = tun::create_as_async(&tun_config).expect("failed to create tun device");
    let (tun_read, tun_write) = tokio::io::split(tun_dev);

    let mut tasks = vec![
        tokio::spawn(noiseguard_tun::run_udp_recv_loop(io.v4_socket(), device.clone())),
        tokio::spawn(noiseguard_tun::run_tun_read_loop(tun_read, device.clone())),
        tokio::spawn(noiseguard_tun::run_inject_loop(tun_write, inject_rx)),
        tokio::spawn(noiseguard_tun::run_timer_loop(device.clone())),
    ];
    if let Some(v6) = io.v6_socket() {
        tasks.push(tokio::spawn(noiseguard_tun::run_udp_recv_loop(v6, device.clone())));
    }

    for task in tasks {
        let _ = task.await;
    }
}
