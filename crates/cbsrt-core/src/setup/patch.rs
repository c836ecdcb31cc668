//! YAML patches for the bridge board's configuration CLI.
//!
//! Three patches are applied in order: VLAN membership of the two bridge
//! ports, an identity PCP decoding/encoding map (8P0D), and the per-class
//! credit-based shaper idle slopes on the egress port.

use std::fmt::Write;

use crate::config::{SessionConfig, TC_COUNT};

const IF_PREFIX: &str = "/ietf-interfaces:interfaces/interface";
const BRIDGE_PORT: &str = "ieee802-dot1q-bridge:bridge-port";

fn port_path(port: &str, leaf: &str) -> String {
    format!("{IF_PREFIX}[name='{port}']/{BRIDGE_PORT}/{leaf}")
}

/// Tags both ports as C-VLAN bridge ports admitting only tagged frames and
/// registers `vlan_id` on both.
pub fn render_vlan_patch(cfg: &SessionConfig) -> String {
    let (egress, ingress) = (&cfg.egress_port, &cfg.ingress_port);
    let mut out = String::from("\n");
    for (leaf, value) in [
        ("port-type", "ieee802-dot1q-bridge:c-vlan-bridge-port"),
        ("acceptable-frame", "admit-only-VLAN-tagged-frames"),
        ("enable-ingress-filtering", "true"),
    ] {
        for port in [egress, ingress] {
            let _ = writeln!(out, "- ? \"{}\"\n  : {value}", port_path(port, leaf));
        }
    }
    let _ = writeln!(
        out,
        "- ? \"/ieee802-dot1q-bridge:bridges/bridge[name='b0']/component[name='c0']/filtering-database/vlan-registration-entry\"\n  \
         : database-id: 0\n    \
         vids: '{}'\n    \
         entry-type: static\n    \
         port-map:",
        cfg.vlan_id
    );
    for port in [egress, ingress] {
        let _ = writeln!(
            out,
            "      - port-ref: {port}\n        \
             static-vlan-registration-entries:\n          \
             vlan-transmitted: tagged"
        );
    }
    out
}

/// Identity PCP → priority decoding on ingress and priority → PCP encoding
/// on egress.
pub fn render_pcp_patch(cfg: &SessionConfig) -> String {
    let decoding = port_path(&cfg.ingress_port, "pcp-decoding-table/pcp-decoding-map");
    let encoding = port_path(&cfg.egress_port, "pcp-encoding-table/pcp-encoding-map");

    let mut out = String::from("\n");
    let _ = writeln!(out, "- ? \"{decoding}\"\n  : pcp: 8P0D");
    let _ = writeln!(out, "- \"{decoding}[pcp='8P0D']/priority-map\":");
    for pcp in 0..TC_COUNT {
        let _ = writeln!(
            out,
            "  - priority-code-point: {pcp}\n    priority: {pcp}\n    drop-eligible: false"
        );
    }
    out.push('\n');
    let _ = writeln!(out, "- ? \"{encoding}\"\n  : pcp: 8P0D");
    let _ = writeln!(out, "- \"{encoding}[pcp='8P0D']/priority-map\":");
    for prio in 0..TC_COUNT {
        let _ = writeln!(
            out,
            "  - priority: {prio}\n    dei: false\n    priority-code-point: {prio}"
        );
    }
    out
}

/// Credit-based shaper idle slope (kbps) per traffic class on the egress port.
pub fn render_cbs_patch(cfg: &SessionConfig) -> String {
    let mut out = String::from("\n");
    let _ = writeln!(
        out,
        "- \"{IF_PREFIX}[name='{}']/mchp-velocitysp-port:eth-qos/config/traffic-class-shapers\":",
        cfg.egress_port
    );
    for (tc, slope) in cfg.idle_slope_kbps.iter().take(TC_COUNT).enumerate() {
        let _ = writeln!(
            out,
            "  - traffic-class: {tc}\n    credit-based:\n      idle-slope: {}",
            *slope as i64
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_patch_covers_both_ports() {
        let cfg = SessionConfig {
            vlan_id: 42,
            ..Default::default()
        };
        let patch = render_vlan_patch(&cfg);
        assert_eq!(patch.matches("c-vlan-bridge-port").count(), 2);
        assert_eq!(patch.matches("admit-only-VLAN-tagged-frames").count(), 2);
        assert!(patch.contains("vids: '42'"));
        assert!(patch.contains("      - port-ref: 1\n"));
        assert!(patch.contains("      - port-ref: 2\n"));
        assert!(patch.contains("interface[name='1']/ieee802-dot1q-bridge:bridge-port/port-type"));
    }

    #[test]
    fn test_pcp_patch_is_identity() {
        let patch = render_pcp_patch(&SessionConfig::default());
        for p in 0..TC_COUNT {
            assert!(patch.contains(&format!(
                "priority-code-point: {p}\n    priority: {p}\n"
            )));
            assert!(patch.contains(&format!(
                "priority: {p}\n    dei: false\n    priority-code-point: {p}\n"
            )));
        }
        assert!(patch.contains("interface[name='2']/ieee802-dot1q-bridge:bridge-port/pcp-decoding-table"));
        assert!(patch.contains("interface[name='1']/ieee802-dot1q-bridge:bridge-port/pcp-encoding-table"));
    }

    #[test]
    fn test_cbs_patch_truncates_slopes() {
        let cfg = SessionConfig {
            idle_slope_kbps: vec![1500.7, 2000.0, 0.0, 0.0, 0.0, 0.0, 0.0, 9000.0],
            ..Default::default()
        };
        let patch = render_cbs_patch(&cfg);
        assert!(patch.contains("traffic-class: 0\n    credit-based:\n      idle-slope: 1500\n"));
        assert!(patch.contains("traffic-class: 7\n    credit-based:\n      idle-slope: 9000\n"));
        assert_eq!(patch.matches("traffic-class:").count(), TC_COUNT);
    }
}
