//! Echo, redirect and fan-out servers hosted next to the load engine.

mod http;
mod tcp;
mod udp;

pub use http::*;
pub use tcp::*;
pub use udp::*;

use pacer_core::ConfigError;

/// Expands a bare port like `"8080"` into a bindable `0.0.0.0:8080`;
/// `host:port` forms pass through.
pub fn listen_addr(spec: &str) -> String {
    if spec.contains(':') {
        spec.to_string()
    } else {
        format!("0.0.0.0:{spec}")
    }
}

/// `-P "localAddr destHost:destPort"`.
pub fn parse_tcp_proxy_spec(spec: &str) -> Result<(String, String), ConfigError> {
    let mut parts = spec.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(dest), None) => Ok((listen_addr(local), dest.to_string())),
        _ => Err(ConfigError::InvalidProxySpec(spec.to_string())),
    }
}

/// `-M "localAddr destURL1 destURL2 …"`.
pub fn parse_multi_spec(
    spec: &str,
    serial: bool,
    mirror_origin: bool,
) -> Result<(String, MultiProxyConfig), ConfigError> {
    let mut parts = spec.split_whitespace();
    let local = parts
        .next()
        .ok_or_else(|| ConfigError::InvalidProxySpec(spec.to_string()))?;
    let targets: Vec<TargetConf> = parts
        .map(|dest| TargetConf {
            destination: dest.to_string(),
            mirror_origin,
        })
        .collect();
    if targets.is_empty() {
        return Err(ConfigError::InvalidProxySpec(spec.to_string()));
    }
    Ok((listen_addr(local), MultiProxyConfig { serial, targets }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_expansion() {
        assert_eq!(listen_addr("8080"), "0.0.0.0:8080");
        assert_eq!(listen_addr("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[test]
    fn tcp_proxy_spec_parsing() {
        let (local, dest) = parse_tcp_proxy_spec("8888 example.com:80").unwrap();
        assert_eq!(local, "0.0.0.0:8888");
        assert_eq!(dest, "example.com:80");
        assert!(parse_tcp_proxy_spec("8888").is_err());
        assert!(parse_tcp_proxy_spec("8888 a b").is_err());
    }

    #[test]
    fn multi_spec_parsing() {
        let (local, cfg) =
            parse_multi_spec("127.0.0.1:0 http://a/ http://b/", true, false).unwrap();
        assert_eq!(local, "127.0.0.1:0");
        assert!(cfg.serial);
        assert_eq!(cfg.targets.len(), 2);
        assert!(!cfg.targets[0].mirror_origin);
        assert!(parse_multi_spec("9000", false, true).is_err());
    }
}
