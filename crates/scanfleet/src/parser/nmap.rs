use quick_xml::de::from_str;
use serde::Deserialize;

use super::ParseError;
use crate::models::{ParsedRecord, PortRecord};

#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, Deserialize)]
struct NmapHost {
    #[serde(default)]
    status: Option<NmapStatus>,
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    hostnames: Option<NmapHostnames>,
    #[serde(default)]
    ports: Option<NmapPorts>,
    #[serde(default)]
    os: Option<NmapOs>,
}

#[derive(Debug, Deserialize)]
struct NmapStatus {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addrtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NmapHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<NmapHostname>,
}

#[derive(Debug, Deserialize)]
struct NmapHostname {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(rename = "@protocol")]
    protocol: String,
    state: NmapState,
    #[serde(default)]
    service: Option<NmapService>,
    #[serde(rename = "script", default)]
    scripts: Vec<NmapScript>,
}

#[derive(Debug, Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct NmapService {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@product", default)]
    product: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NmapScript {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@output", default)]
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NmapOs {
    #[serde(rename = "osmatch", default)]
    matches: Vec<NmapOsMatch>,
}

#[derive(Debug, Deserialize)]
struct NmapOsMatch {
    #[serde(rename = "@name")]
    name: String,
}

/// Open ports from `nmap -oX` output. Hosts that are down or have no open
/// port produce nothing.
pub fn parse_nmap_xml(xml: &str) -> Result<Vec<ParsedRecord>, ParseError> {
    let run: NmapRun = from_str(xml)?;
    let mut records = Vec::new();

    for host in run.hosts {
        if host.status.as_ref().is_some_and(|s| s.state != "up") {
            continue;
        }
        let Some(address) = host
            .addresses
            .iter()
            .find(|a| matches!(a.addrtype.as_deref(), None | Some("ipv4") | Some("ipv6")))
            .map(|a| a.addr.clone())
        else {
            continue;
        };
        let hostname = host
            .hostnames
            .as_ref()
            .and_then(|h| h.hostnames.first().map(|e| e.name.clone()));
        let os = host
            .os
            .as_ref()
            .and_then(|os| os.matches.first().map(|m| m.name.clone()));

        let Some(ports) = host.ports else {
            continue;
        };
        for p in ports.ports.into_iter().filter(|p| p.state.state == "open") {
            let service = p.service.as_ref();
            records.push(ParsedRecord::OpenPort(PortRecord {
                address: address.clone(),
                hostname: hostname.clone(),
                port: p.portid,
                protocol: p.protocol,
                service_name: service.and_then(|s| s.name.clone()),
                product: service.and_then(|s| s.product.clone()),
                version: service.and_then(|s| s.version.clone()),
                banner: p
                    .scripts
                    .iter()
                    .find(|s| s.id == "banner")
                    .and_then(|s| s.output.clone()),
                os: os.clone(),
            }));
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_ports(records: &[ParsedRecord]) -> Vec<&PortRecord> {
        records
            .iter()
            .filter_map(|r| match r {
                ParsedRecord::OpenPort(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn parse_nmap_xml_extracts_open_ports_only() {
        let xml = include_str!("../../fixtures/nmap_sample.xml");
        let records = parse_nmap_xml(xml).expect("parse should work");
        let ports = open_ports(&records);
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| p.address == "192.168.1.1"));
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[1].port, 80);
    }

    #[test]
    fn host_details_are_carried_on_every_port() {
        let xml = include_str!("../../fixtures/nmap_sample.xml");
        let records = parse_nmap_xml(xml).expect("parse should work");
        let ssh = open_ports(&records)[0];
        assert_eq!(ssh.hostname.as_deref(), Some("gw.lab.local"));
        assert_eq!(ssh.os.as_deref(), Some("Linux 4.15 - 5.6"));
        assert_eq!(ssh.product.as_deref(), Some("OpenSSH"));
        assert_eq!(ssh.version.as_deref(), Some("7.4"));
        assert_eq!(ssh.banner.as_deref(), Some("SSH-2.0-OpenSSH_7.4"));
    }

    #[test]
    fn empty_run_yields_no_records() {
        let records = parse_nmap_xml("<nmaprun></nmaprun>").expect("parse should work");
        assert!(records.is_empty());
    }
}
