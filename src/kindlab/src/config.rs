/// Lab configuration
/// Loaded from kindlab.toml; every field has a default so the file is optional.
use crate::error::{LabError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "kindlab.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LabConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub cilium: CiliumConfig,

    #[serde(default)]
    pub bgp: BgpConfig,

    #[serde(default)]
    pub l2: L2Config,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Where generated files, pid files and logs go.
    /// Defaults to ~/.kindlab/<cluster name>.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl LabConfig {
    /// Load configuration. An explicit path must exist; otherwise the usual
    /// locations are searched and defaults are used when nothing is found.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(LabError::MissingFile(path.to_path_buf()));
            }
            return Self::load_from(path);
        }

        let mut config_paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            config_paths.push(home.join(".kindlab").join(CONFIG_FILE_NAME));
        }

        for path in config_paths {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        tracing::warn!("No {} found, using defaults", CONFIG_FILE_NAME);
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LabError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let mut config = Self::parse(&content)
            .map_err(|e| LabError::Config(format!("{:?}: {}", path, e)))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;

        tracing::info!("Loaded lab config from {:?}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LabError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Make relative asset paths relative to the directory holding the config file.
    pub fn resolve_paths(&mut self, base: &Path) {
        if base.as_os_str().is_empty() {
            return;
        }
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.cluster.config_path);
        rebase(&mut self.cilium.values_path);
        rebase(&mut self.app.manifests_dir);
        rebase(&mut self.app.gateway_manifests_dir);
        if let Some(dir) = self.state_dir.as_mut() {
            rebase(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let name = &self.cluster.name;
        let valid_name = !name.is_empty()
            && name.len() <= 50
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !name.starts_with('-')
            && !name.ends_with('-');
        if !valid_name {
            return Err(LabError::Config(format!(
                "cluster.name '{}' must be a lowercase DNS label (a-z, 0-9, '-')",
                name
            )));
        }

        if self.bgp.enabled {
            if self.bgp.router_asn == 0 || self.bgp.cluster_asn == 0 {
                return Err(LabError::Config("bgp ASNs must be non-zero".to_string()));
            }
            if self.bgp.router_asn == self.bgp.cluster_asn {
                return Err(LabError::Config(format!(
                    "bgp.router_asn and bgp.cluster_asn are both {}; the lab peers over eBGP",
                    self.bgp.router_asn
                )));
            }
        }

        if self.probe.canary_requests == 0 {
            return Err(LabError::Config(
                "probe.canary_requests must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// kubectl/cilium context Kind registers for this cluster.
    pub fn kube_context(&self) -> String {
        format!("kind-{}", self.cluster.name)
    }

    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".kindlab")
                .join(&self.cluster.name),
        }
    }
}

/// Kind cluster topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Declarative node topology passed to `kind create cluster --config`.
    #[serde(default = "default_kind_config")]
    pub config_path: PathBuf,

    /// Optional kindest/node image override.
    #[serde(default)]
    pub node_image: Option<String>,

    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,
}

impl ClusterConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            config_path: default_kind_config(),
            node_image: None,
            create_timeout_secs: default_create_timeout(),
        }
    }
}

fn default_cluster_name() -> String {
    "cilium-lab".to_string()
}

fn default_kind_config() -> PathBuf {
    PathBuf::from("deploy/kind-config.yaml")
}

fn default_create_timeout() -> u64 {
    300
}

/// Cilium Helm release and Gateway API CRDs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiliumConfig {
    #[serde(default = "default_cilium_version")]
    pub version: String,

    #[serde(default = "default_repo_name")]
    pub repo_name: String,

    #[serde(default = "default_repo_url")]
    pub repo_url: String,

    #[serde(default = "default_release")]
    pub release: String,

    #[serde(default = "default_cilium_namespace")]
    pub namespace: String,

    #[serde(default = "default_values_path")]
    pub values_path: PathBuf,

    #[serde(default = "default_gateway_api_version")]
    pub gateway_api_version: String,

    /// Pull chart images on the host and load them into the nodes before install.
    #[serde(default = "default_true")]
    pub preload_images: bool,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Pool handed out to LoadBalancer services (and gateways).
    #[serde(default = "default_lb_pool")]
    pub lb_pool_cidr: String,
}

impl CiliumConfig {
    pub fn chart(&self) -> String {
        format!("{}/cilium", self.repo_name)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl Default for CiliumConfig {
    fn default() -> Self {
        Self {
            version: default_cilium_version(),
            repo_name: default_repo_name(),
            repo_url: default_repo_url(),
            release: default_release(),
            namespace: default_cilium_namespace(),
            values_path: default_values_path(),
            gateway_api_version: default_gateway_api_version(),
            preload_images: true,
            ready_timeout_secs: default_ready_timeout(),
            lb_pool_cidr: default_lb_pool(),
        }
    }
}

fn default_cilium_version() -> String {
    "1.16.5".to_string()
}

fn default_repo_name() -> String {
    "cilium".to_string()
}

fn default_repo_url() -> String {
    "https://helm.cilium.io/".to_string()
}

fn default_release() -> String {
    "cilium".to_string()
}

fn default_cilium_namespace() -> String {
    "kube-system".to_string()
}

fn default_values_path() -> PathBuf {
    PathBuf::from("deploy/cilium-values.yaml")
}

fn default_gateway_api_version() -> String {
    "v1.2.0".to_string()
}

fn default_ready_timeout() -> u64 {
    300
}

fn default_lb_pool() -> String {
    "172.18.255.200/29".to_string()
}

fn default_true() -> bool {
    true
}

/// FRR router container and BGP peering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_router_name")]
    pub router_name: String,

    #[serde(default = "default_router_image")]
    pub router_image: String,

    /// Docker network the router joins (Kind's network).
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default = "default_router_asn")]
    pub router_asn: u32,

    #[serde(default = "default_cluster_asn")]
    pub cluster_asn: u32,

    #[serde(default = "default_router_id")]
    pub router_id: String,

    /// Node label selecting which nodes run a BGP instance.
    #[serde(default = "default_node_label")]
    pub node_label: String,
}

impl Default for BgpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            router_name: default_router_name(),
            router_image: default_router_image(),
            network: default_network(),
            router_asn: default_router_asn(),
            cluster_asn: default_cluster_asn(),
            router_id: default_router_id(),
            node_label: default_node_label(),
        }
    }
}

fn default_router_name() -> String {
    "kindlab-frr".to_string()
}

fn default_router_image() -> String {
    "quay.io/frrouting/frr:9.1.0".to_string()
}

fn default_network() -> String {
    "kind".to_string()
}

fn default_router_asn() -> u32 {
    65000
}

fn default_cluster_asn() -> u32 {
    65001
}

fn default_router_id() -> String {
    "10.255.0.1".to_string()
}

fn default_node_label() -> String {
    "kindlab.io/bgp=enabled".to_string()
}

/// L2 announcements, used instead of BGP when BGP is disabled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2Config {
    /// Interfaces (regex) the L2 policy announces on.
    #[serde(default = "default_l2_interfaces")]
    pub interfaces: Vec<String>,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            interfaces: default_l2_interfaces(),
        }
    }
}

fn default_l2_interfaces() -> Vec<String> {
    vec!["^eth[0-9]+".to_string()]
}

/// Demo application and its Gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_namespace")]
    pub namespace: String,

    #[serde(default = "default_app_manifests")]
    pub manifests_dir: PathBuf,

    #[serde(default = "default_gateway_manifests")]
    pub gateway_manifests_dir: PathBuf,

    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,

    #[serde(default = "default_hostnames")]
    pub hostnames: Vec<String>,

    /// Issue a certificate with mkcert and store it as a TLS secret.
    #[serde(default = "default_true")]
    pub tls: bool,

    #[serde(default = "default_tls_secret")]
    pub tls_secret: String,

    #[serde(default = "default_app_timeout")]
    pub ready_timeout_secs: u64,
}

impl AppConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: default_app_namespace(),
            manifests_dir: default_app_manifests(),
            gateway_manifests_dir: default_gateway_manifests(),
            gateway_name: default_gateway_name(),
            hostnames: default_hostnames(),
            tls: true,
            tls_secret: default_tls_secret(),
            ready_timeout_secs: default_app_timeout(),
        }
    }
}

fn default_app_namespace() -> String {
    "demo".to_string()
}

fn default_app_manifests() -> PathBuf {
    PathBuf::from("deploy/app")
}

fn default_gateway_manifests() -> PathBuf {
    PathBuf::from("deploy/gateway")
}

fn default_gateway_name() -> String {
    "demo-gateway".to_string()
}

fn default_hostnames() -> Vec<String> {
    vec![
        "shop.lab.local".to_string(),
        "canary.lab.local".to_string(),
        "legacy.lab.local".to_string(),
    ]
}

fn default_tls_secret() -> String {
    "demo-tls".to_string()
}

fn default_app_timeout() -> u64 {
    180
}

/// Hubble UI and port-forwards launched in the background
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_true")]
    pub hubble_ui: bool,

    #[serde(default = "default_hubble_port")]
    pub hubble_ui_port: u16,

    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            hubble_ui: true,
            hubble_ui_port: default_hubble_port(),
            port_forwards: Vec::new(),
        }
    }
}

fn default_hubble_port() -> u16 {
    12000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub name: String,
    pub namespace: String,
    /// e.g. `svc/frontend`
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Route probes used by `test` and `canary`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteCheck>,

    #[serde(default = "default_canary_host")]
    pub canary_host: String,

    #[serde(default = "default_canary_path")]
    pub canary_path: String,

    #[serde(default = "default_canary_requests")]
    pub canary_requests: usize,

    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            canary_host: default_canary_host(),
            canary_path: default_canary_path(),
            canary_requests: default_canary_requests(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteCheck {
    pub host: String,
    #[serde(default = "default_canary_path")]
    pub path: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

fn default_routes() -> Vec<RouteCheck> {
    vec![
        RouteCheck {
            host: "shop.lab.local".to_string(),
            path: "/".to_string(),
            expect_status: 200,
        },
        RouteCheck {
            host: "shop.lab.local".to_string(),
            path: "/api/catalog".to_string(),
            expect_status: 200,
        },
        RouteCheck {
            host: "legacy.lab.local".to_string(),
            path: "/".to_string(),
            expect_status: 301,
        },
    ]
}

fn default_canary_host() -> String {
    "canary.lab.local".to_string()
}

fn default_canary_path() -> String {
    "/".to_string()
}

fn default_canary_requests() -> usize {
    100
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_expect_status() -> u16 {
    200
}
