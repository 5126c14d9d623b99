//! Demo binary: wires an in-memory topology to a [`Router`] and prints the
//! resulting [`Action`] for an ARP probe against its own port — enough to
//! exercise the wiring end to end without a real datapath attached.

use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vnet_agent::{
    config::RouterConfig,
    router::{
        port::{PortId, PortResolver, PortVariant, RouterPort},
        Ingress, Router,
    },
};
use vnet_types::{arp::ArpPacket, ethernet::ETHERTYPE_ARP, ethernet::EthernetFrame, mac::MacAddress};

/// A small demo of the router/ARP pipeline.
#[derive(Parser)]
#[command(name = "vnet-agent")]
#[command(about = "Demo of the router/ARP control-plane core")]
struct Cli {
    /// Tracing filter, e.g. `debug` or `vnet_agent=trace`. Overridden by `RUST_LOG`.
    #[arg(long, default_value = "info")]
    log_filter: String,

    /// IP address to ARP for on the demo port.
    #[arg(long, default_value = "10.0.0.1")]
    probe_ip: Ipv4Addr,
}

struct StaticTopology(HashMap<PortId, RouterPort>);

#[async_trait::async_trait]
impl PortResolver for StaticTopology {
    async fn port(&self, id: PortId) -> Option<RouterPort> {
        self.0.get(&id).copied()
    }
}

struct LoggingSink;

#[async_trait::async_trait]
impl vnet_agent::arp::FrameSink for LoggingSink {
    async fn emit(&self, port_id: PortId, frame: EthernetFrame) -> vnet_agent::error::AgentResult<()> {
        tracing::info!(port_id, dst = %frame.dst, src = %frame.src, ethertype = frame.ethertype, "emitting frame");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let demo_port = RouterPort {
        id: 1,
        mac: MacAddress::from([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
        ip: Ipv4Addr::new(10, 0, 0, 1),
        nw_addr: Ipv4Addr::new(10, 0, 0, 0),
        nw_length: 24,
        variant: PortVariant::Exterior,
    };
    let mut ports = HashMap::new();
    ports.insert(demo_port.id, demo_port);

    let resolver: Arc<dyn PortResolver> = Arc::new(StaticTopology(ports));
    let sink: Arc<dyn vnet_agent::arp::FrameSink> = Arc::new(LoggingSink);
    let router = Router::new(resolver, sink, RouterConfig::default());

    let requester_mac = MacAddress::from([0x02, 0x00, 0x00, 0x00, 0x00, 0x99]);
    let arp = ArpPacket::new_request(requester_mac, Ipv4Addr::new(10, 0, 0, 200), cli.probe_ip);
    let frame = EthernetFrame {
        dst: MacAddress::BROADCAST,
        src: requester_mac,
        ethertype: ETHERTYPE_ARP,
        payload: arp.to_vec().expect("arp packet encodes"),
    };

    match router.process(Ingress { port_id: 1, frame }).await {
        Ok(action) => tracing::info!(?action, "router processed probe"),
        Err(e) => tracing::error!(error = %e, "router failed to process probe"),
    }
}
