//! `IpsecContainer` (§4.6): renders config, drives the `vpn-helper`
//! executable through a create/update/delete lifecycle with compensating
//! rollback on setup failure, and reconfigures itself whenever the VPN
//! service's topology changes underneath it.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{
    error::{AgentError, AgentResult},
    router::port::{PortId, PortResolver},
};

use super::render::{render_conf, render_secrets, IPSecServiceDef, IPSecSiteConnection};

/// One external helper invocation (§6: "positional `<cmd>` then flags").
/// Modeled as a trait so tests can record the call trace instead of
/// shelling out — the production implementation below drives the real
/// `vpn-helper` executable through `tokio::process::Command`.
#[async_trait::async_trait]
pub trait HelperInvoker: Send + Sync {
    async fn invoke(&self, step: &'static str, args: &[String]) -> AgentResult<()>;
}

/// Invokes a real helper executable on disk.
pub struct ProcessHelperInvoker {
    pub helper_path: PathBuf,
}

#[async_trait::async_trait]
impl HelperInvoker for ProcessHelperInvoker {
    async fn invoke(&self, step: &'static str, args: &[String]) -> AgentResult<()> {
        let output = tokio::process::Command::new(&self.helper_path)
            .arg(step)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            error!(step, code = ?output.status.code(), "vpn-helper step failed");
            return Err(AgentError::IPSecException { step, code: output.status.code() });
        }
        Ok(())
    }
}

/// The VPN service's resolved topology (§4.6 item 5): `VpnService`'s own
/// `adminStateUp` plus the `IPSecSiteConnection`s currently belonging to
/// it. An empty `connections` or `admin_state_up = false` both resolve to
/// "stay torn down".
#[derive(Debug, Clone)]
pub struct VpnTopologyState {
    pub admin_state_up: bool,
    pub connections: Vec<IPSecSiteConnection>,
}

/// The topology-watch collaborator (out of scope per §1): publishes a new
/// [`VpnTopologyState`] whenever `VpnService.adminStateUp`, or the set of
/// `IPSecSiteConnection`s belonging to `container_port_id`, changes.
pub trait TopologySource: Send + Sync {
    fn subscribe(&self, container_port_id: PortId) -> broadcast::Receiver<VpnTopologyState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Up,
    Down,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCode {
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
pub struct ContainerHealth {
    pub code: HealthCode,
    pub description: String,
}

/// In-process knobs used to fill in an [`IPSecServiceDef`] at `create` time
/// (§4.6 step 1: the parts of the service definition this container owns
/// outright, as opposed to the router-port lookup).
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub tmp_root: PathBuf,
    pub interface_name: String,
    pub namespace_interface_ip: vnet_types::ip::Cidr,
    pub namespace_gateway_ip: std::net::Ipv4Addr,
    pub namespace_gateway_mac: vnet_types::mac::MacAddress,
}

struct State {
    status: ContainerStatus,
    current: Option<(IPSecServiceDef, Vec<IPSecSiteConnection>)>,
    /// The background task driving §4.6 item 5; cancelled by `delete`
    /// (§4.6 item 6: "unsubscribe from the topology observable").
    subscription: Option<JoinHandle<()>>,
}

struct Inner {
    ports: Arc<dyn PortResolver>,
    helper: Arc<dyn HelperInvoker>,
    topology: Arc<dyn TopologySource>,
    config: ContainerConfig,
    state: RwLock<State>,
}

/// Cheaply cloneable handle; the topology-subscription task holds its own
/// clone so it can drive `create`/teardown on the container's behalf.
#[derive(Clone)]
pub struct IpsecContainer(Arc<Inner>);

impl IpsecContainer {
    #[must_use]
    pub fn new(ports: Arc<dyn PortResolver>, helper: Arc<dyn HelperInvoker>, topology: Arc<dyn TopologySource>, config: ContainerConfig) -> Self {
        Self(Arc::new(Inner {
            ports,
            helper,
            topology,
            config,
            state: RwLock::new(State { status: ContainerStatus::Down, current: None, subscription: None }),
        }))
    }

    fn filepath(&self) -> String {
        format!("{}/{}", self.0.config.tmp_root.display(), self.0.config.interface_name)
    }

    /// §4.6 step 1: resolves the router's external port, subscribes to this
    /// container's topology (regardless of admin state), then — unless the
    /// parent VpnService is administratively down — sets up the container.
    pub async fn create(&self, container_port_id: PortId, vpn_admin_state_up: bool, connections: Vec<IPSecSiteConnection>) -> AgentResult<Option<ContainerHealth>> {
        if self.0.ports.port(container_port_id).await.is_none() {
            return Err(AgentError::IPSecException { step: "create", code: None });
        }

        self.ensure_subscribed(container_port_id).await;

        if !vpn_admin_state_up {
            debug!(interface = %self.0.config.interface_name, "vpn service administratively down, not setting up");
            return Ok(None);
        }

        self.setup_and_record(container_port_id, connections).await
    }

    /// Starts the topology-subscription task if one isn't already running
    /// for this container. Synchronous with respect to `create`'s caller:
    /// by the time this returns, the subscription is registered.
    async fn ensure_subscribed(&self, container_port_id: PortId) {
        let mut state = self.0.state.write().await;
        if state.subscription.is_some() {
            return;
        }
        let mut rx = self.0.topology.subscribe(container_port_id);
        let watcher = self.clone();
        state.subscription = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => {
                        if let Err(e) = watcher.apply_topology_update(container_port_id, update).await {
                            warn!(error = %e, "failed to apply vpn topology update");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }

    /// §4.6 item 5: on every topology change, tear down, then re-setup only
    /// if the new resolved config is non-empty; otherwise stay torn down.
    async fn apply_topology_update(&self, container_port_id: PortId, update: VpnTopologyState) -> AgentResult<()> {
        self.tear_down_current().await?;
        if update.admin_state_up && !update.connections.is_empty() {
            self.setup_and_record(container_port_id, update.connections).await?;
        }
        Ok(())
    }

    /// Resolves the port, renders/applies config, and records the result —
    /// the part of `create` shared with topology-driven reconfiguration.
    async fn setup_and_record(&self, container_port_id: PortId, connections: Vec<IPSecSiteConnection>) -> AgentResult<Option<ContainerHealth>> {
        let Some(port) = self.0.ports.port(container_port_id).await else {
            return Err(AgentError::IPSecException { step: "create", code: None });
        };

        let service = IPSecServiceDef {
            name: self.0.config.interface_name.clone(),
            filepath: self.filepath(),
            local_endpoint_ip: port.ip,
            local_endpoint_mac: port.mac,
            namespace_interface_ip: self.0.config.namespace_interface_ip,
            namespace_gateway_ip: self.0.config.namespace_gateway_ip,
            namespace_gateway_mac: self.0.config.namespace_gateway_mac,
        };

        self.setup(service.clone(), connections.clone()).await?;
        {
            let mut state = self.0.state.write().await;
            state.status = ContainerStatus::Up;
            state.current = Some((service, connections));
        }
        Ok(Some(ContainerHealth {
            code: HealthCode::Running,
            description: self.0.config.interface_name.clone(),
        }))
    }

    /// §4.6 step 2: writes the rendered config, then drives the helper
    /// through `prepare, cleanns, makens, start_service, init_conns`,
    /// rolling back in reverse on the first failure in steps 3-5.
    async fn setup(&self, service: IPSecServiceDef, connections: Vec<IPSecSiteConnection>) -> AgentResult<()> {
        let path = PathBuf::from(&service.filepath);
        let _ = tokio::fs::remove_dir_all(&path).await;
        tokio::fs::create_dir_all(path.join("etc")).await?;
        tokio::fs::write(path.join("ipsec.conf"), render_conf(&service, &connections)).await?;
        tokio::fs::write(path.join("ipsec.secrets"), render_secrets(&service, &connections)).await?;

        let name = service.name.clone();

        self.0.helper.invoke("prepare", &[]).await?;
        self.0.helper.invoke("cleanns", &cleanns_args(&name)).await?;

        if let Err(e) = self.0.helper.invoke("makens", &makens_args(&name, &service)).await {
            let _ = self.0.helper.invoke("cleanns", &cleanns_args(&name)).await;
            return Err(e);
        }

        if let Err(e) = self.0.helper.invoke("start_service", &start_service_args(&name, &service.filepath)).await {
            let _ = self.0.helper.invoke("stop_service", &stop_service_args(&name, &service.filepath)).await;
            let _ = self.0.helper.invoke("cleanns", &cleanns_args(&name)).await;
            return Err(e);
        }

        let conn_names: Vec<String> = admin_up_names(&connections);
        if let Err(e) = self
            .0
            .helper
            .invoke("init_conns", &init_conns_args(&name, &service.filepath, service.namespace_gateway_ip, &conn_names))
            .await
        {
            let _ = self.0.helper.invoke("stop_service", &stop_service_args(&name, &service.filepath)).await;
            let _ = self.0.helper.invoke("cleanns", &cleanns_args(&name)).await;
            return Err(e);
        }

        Ok(())
    }

    /// §4.6 step 3: the full (non-rollback) teardown used by `update`,
    /// `delete`, and topology-driven reconfiguration — `stop_service`,
    /// `cleanns`, then remove `filepath`.
    async fn full_cleanup(&self, service: &IPSecServiceDef) -> AgentResult<()> {
        self.0.helper.invoke("stop_service", &stop_service_args(&service.name, &service.filepath)).await?;
        self.0.helper.invoke("cleanns", &cleanns_args(&service.name)).await?;
        let _ = tokio::fs::remove_dir_all(&service.filepath).await;
        Ok(())
    }

    /// Tears down whatever is currently running, if anything, and marks
    /// the container `Down`. A no-op when already torn down.
    async fn tear_down_current(&self) -> AgentResult<()> {
        let previous = self.0.state.write().await.current.take();
        if let Some((old_service, _)) = previous {
            self.full_cleanup(&old_service).await?;
            self.0.state.write().await.status = ContainerStatus::Down;
        }
        Ok(())
    }

    /// §4.6 step 4: tear down, then set up again with the new inputs.
    pub async fn update(&self, container_port_id: PortId, vpn_admin_state_up: bool, connections: Vec<IPSecSiteConnection>) -> AgentResult<Option<ContainerHealth>> {
        self.tear_down_current().await?;
        self.create(container_port_id, vpn_admin_state_up, connections).await
    }

    /// §4.6 step 6: tear down if running, then cancel the topology
    /// subscription; idempotent if never started.
    pub async fn delete(&self) -> AgentResult<()> {
        self.tear_down_current().await?;
        let subscription = self.0.state.write().await.subscription.take();
        if let Some(handle) = subscription {
            handle.abort();
        }
        self.0.state.write().await.status = ContainerStatus::Deleted;
        Ok(())
    }

    #[must_use]
    pub async fn status(&self) -> ContainerStatus {
        self.0.state.read().await.status
    }
}

fn admin_up_names(connections: &[IPSecSiteConnection]) -> Vec<String> {
    connections
        .iter()
        .filter(|c| c.admin_state_up)
        .map(|c| super::render::sanitize_connection_name(&c.name))
        .collect()
}

fn cleanns_args(name: &str) -> Vec<String> {
    vec!["-n".to_string(), name.to_string()]
}

fn makens_args(name: &str, service: &IPSecServiceDef) -> Vec<String> {
    vec![
        "-n".to_string(),
        name.to_string(),
        "-g".to_string(),
        service.namespace_gateway_ip.to_string(),
        "-G".to_string(),
        service.namespace_gateway_mac.to_string(),
        "-l".to_string(),
        service.local_endpoint_ip.to_string(),
        "-i".to_string(),
        service.namespace_interface_ip.to_string(),
        "-m".to_string(),
        service.local_endpoint_mac.to_string(),
    ]
}

fn start_service_args(name: &str, path: &str) -> Vec<String> {
    vec!["-n".to_string(), name.to_string(), "-p".to_string(), path.to_string()]
}

fn stop_service_args(name: &str, path: &str) -> Vec<String> {
    vec!["-n".to_string(), name.to_string(), "-p".to_string(), path.to_string()]
}

fn init_conns_args(name: &str, path: &str, gateway: std::net::Ipv4Addr, conn_names: &[String]) -> Vec<String> {
    let mut args = vec!["-n".to_string(), name.to_string(), "-p".to_string(), path.to_string(), "-g".to_string(), gateway.to_string()];
    for conn in conn_names {
        args.push("-c".to_string());
        args.push(conn.clone());
    }
    args
}
