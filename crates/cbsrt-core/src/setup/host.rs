//! Host-side network setup: VLAN sub-interfaces and performance tuning.

use crate::config::{SessionConfig, TC_COUNT};

/// A command as program + argv.
pub type CommandLine = (String, Vec<String>);

fn ip(args: &[&str]) -> CommandLine {
    ("ip".to_string(), args.iter().map(|s| s.to_string()).collect())
}

/// Names of the ingress/egress VLAN sub-interfaces for `vlan_id`.
pub fn vlan_iface_names(vlan_id: u16) -> (String, String) {
    (format!("vlan{vlan_id}"), format!("vlan{vlan_id}b"))
}

/// Removes stale VLAN sub-interfaces. Failures mean "not present".
pub fn vlan_teardown_commands(cfg: &SessionConfig) -> Vec<CommandLine> {
    let (rx_vlan, tx_vlan) = vlan_iface_names(cfg.vlan_id);
    vec![
        ip(&["link", "del", &rx_vlan]),
        ip(&["link", "del", &tx_vlan]),
    ]
}

/// Creates one tagged sub-interface per side with a /24 in `10.0.<vlan>.0`
/// and maps socket priority 0..7 to the same PCP on the ingress side.
pub fn vlan_setup_commands(cfg: &SessionConfig) -> Vec<CommandLine> {
    let vlan = cfg.vlan_id.to_string();
    let (rx_vlan, tx_vlan) = vlan_iface_names(cfg.vlan_id);
    let rx_addr = format!("10.0.{vlan}.1/24");
    let tx_addr = format!("10.0.{vlan}.2/24");

    let mut qos_map: Vec<String> = ["link", "set", "dev", &rx_vlan, "type", "vlan", "egress-qos-map"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    qos_map.extend((0..TC_COUNT).map(|p| format!("{p}:{p}")));

    vec![
        ip(&["link", "add", "link", &cfg.ingress_iface, "name", &rx_vlan, "type", "vlan", "id", &vlan]),
        ip(&["link", "add", "link", &cfg.egress_iface, "name", &tx_vlan, "type", "vlan", "id", &vlan]),
        ip(&["addr", "add", &rx_addr, "dev", &rx_vlan]),
        ip(&["addr", "add", &tx_addr, "dev", &tx_vlan]),
        ip(&["link", "set", &rx_vlan, "up"]),
        ip(&["link", "set", &tx_vlan, "up"]),
        ("ip".to_string(), qos_map),
    ]
}

/// CPU governor to `performance`, USB autosuspend off. Best effort.
pub fn tuning_commands() -> Vec<CommandLine> {
    [
        "for c in /sys/devices/system/cpu/cpu*/cpufreq/scaling_governor; do echo performance > $c 2>/dev/null || true; done",
        "echo -1 > /sys/module/usbcore/parameters/autosuspend 2>/dev/null || true",
    ]
    .iter()
    .map(|script| ("sh".to_string(), vec!["-c".to_string(), script.to_string()]))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(cmd: &CommandLine) -> String {
        format!("{} {}", cmd.0, cmd.1.join(" "))
    }

    #[test]
    fn test_vlan_setup_sequence() {
        let cfg = SessionConfig {
            vlan_id: 7,
            ingress_iface: "eth0".to_string(),
            egress_iface: "eth1".to_string(),
            ..Default::default()
        };
        let cmds: Vec<String> = vlan_setup_commands(&cfg).iter().map(joined).collect();
        assert_eq!(cmds[0], "ip link add link eth0 name vlan7 type vlan id 7");
        assert_eq!(cmds[1], "ip link add link eth1 name vlan7b type vlan id 7");
        assert_eq!(cmds[2], "ip addr add 10.0.7.1/24 dev vlan7");
        assert_eq!(cmds[3], "ip addr add 10.0.7.2/24 dev vlan7b");
        assert_eq!(
            cmds[6],
            "ip link set dev vlan7 type vlan egress-qos-map 0:0 1:1 2:2 3:3 4:4 5:5 6:6 7:7"
        );
    }

    #[test]
    fn test_teardown_targets_both_sides() {
        let cmds: Vec<String> = vlan_teardown_commands(&SessionConfig::default())
            .iter()
            .map(joined)
            .collect();
        assert_eq!(cmds, vec!["ip link del vlan100", "ip link del vlan100b"]);
    }
}
