//! Embedded templates, compiled into the binary so kindlab runs from any directory.

/// FRR router
pub static FRR_CONF: &str = include_str!("templates/bgp/frr.conf.j2");
pub static FRR_DAEMONS: &str = include_str!("templates/bgp/daemons.j2");

/// Cilium BGP control plane objects
pub static CILIUM_BGP_YAML: &str = include_str!("templates/bgp/cilium-bgp.yaml.j2");

/// Load balancer address management
pub static LB_IPAM_POOL_YAML: &str = include_str!("templates/network/lb-ipam-pool.yaml.j2");
pub static L2_ANNOUNCEMENT_YAML: &str = include_str!("templates/network/l2-announcement.yaml.j2");

/// All embedded templates as (name, content) pairs for registration with Tera.
pub const ALL_TEMPLATES: &[(&str, &str)] = &[
    ("bgp/frr.conf.j2", FRR_CONF),
    ("bgp/daemons.j2", FRR_DAEMONS),
    ("bgp/cilium-bgp.yaml.j2", CILIUM_BGP_YAML),
    ("network/lb-ipam-pool.yaml.j2", LB_IPAM_POOL_YAML),
    ("network/l2-announcement.yaml.j2", L2_ANNOUNCEMENT_YAML),
];
