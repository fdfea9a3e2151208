//! 配置校验模块
//!
//! 先运行 `validator` 派生的字段范围检查，再做跨字段语义校验：
//! - 窗口不超过显示最大尺寸
//! - 视图宽高为正
//! - PIM 方位数为 2 的幂
//! - SSC 阈值不超过窗口长度
//! - 真尾迹半径为正
//! - 网络地址与组播组合法
//! - 模拟目标在量程内
//! - sink 名称唯一，file sink 带 path

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use contracts::{ScBlueprint, ScError, SinkType};
use validator::Validate;

/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(blueprint: &ScBlueprint) -> Result<(), ScError> {
    validate_ranges(blueprint)?;
    validate_window(blueprint)?;
    validate_scan(blueprint)?;
    validate_net(blueprint)?;
    validate_mcast(blueprint)?;
    validate_feed(blueprint)?;
    validate_sinks(blueprint)?;
    Ok(())
}

/// 派生规则
fn validate_ranges(blueprint: &ScBlueprint) -> Result<(), ScError> {
    blueprint.validate().map_err(|errors| {
        let detail = errors.to_string();
        let field = detail
            .split(':')
            .next()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or("blueprint")
            .to_string();
        ScError::config_validation(field, detail)
    })
}

fn validate_window(blueprint: &ScBlueprint) -> Result<(), ScError> {
    let display = &blueprint.display;
    blueprint
        .scan
        .window
        .validate(display.max_width, display.max_height)
        .map_err(|e| ScError::config_validation("scan.window", e.to_string()))
}

fn validate_scan(blueprint: &ScBlueprint) -> Result<(), ScError> {
    let scan = &blueprint.scan;
    scan.view
        .validate()
        .map_err(|e| ScError::config_validation("scan.view", e.to_string()))?;
    if !scan.pim_azimuths.is_power_of_two() {
        return Err(ScError::config_validation(
            "scan.pim_azimuths",
            format!("{} is not a power of two", scan.pim_azimuths),
        ));
    }
    if scan.ssc.window_threshold > scan.ssc.window_length {
        return Err(ScError::config_validation(
            "scan.ssc.window_threshold",
            format!(
                "window_threshold ({}) must be <= window_length ({})",
                scan.ssc.window_threshold, scan.ssc.window_length
            ),
        ));
    }
    for (idx, range) in scan.true_trails.ranges.iter().enumerate() {
        if !(range.is_finite() && *range > 0.0) {
            return Err(ScError::config_validation(
                format!("scan.true_trails.ranges[{idx}]"),
                format!("trail range must be > 0, got {range}"),
            ));
        }
    }
    if let Some(trails) = &scan.trails {
        if trails.rate == 0 {
            return Err(ScError::config_validation("scan.trails.rate", "rate must be >= 1"));
        }
    }
    Ok(())
}

fn validate_net(blueprint: &ScBlueprint) -> Result<(), ScError> {
    let net = &blueprint.net;
    net.server_host.parse::<IpAddr>().map_err(|_| {
        ScError::config_validation(
            "net.server_host",
            format!("'{}' is not an IP address", net.server_host),
        )
    })?;
    let group = parse_ipv4("net.heartbeat_group", &net.heartbeat_group)?;
    if !(group.is_multicast() || group.is_loopback() || group.is_broadcast()) {
        return Err(ScError::config_validation(
            "net.heartbeat_group",
            format!("{group} is not a multicast, broadcast or loopback address"),
        ));
    }
    Ok(())
}

fn validate_mcast(blueprint: &ScBlueprint) -> Result<(), ScError> {
    let Some(mcast) = &blueprint.mcast else {
        return Ok(());
    };
    let group = parse_ipv4("mcast.group", &mcast.group)?;
    if !group.is_multicast() {
        return Err(ScError::config_validation(
            "mcast.group",
            format!("{group} is not in 224.0.0.0/4"),
        ));
    }
    parse_ipv4("mcast.interface", &mcast.interface)?;
    if mcast.config_interval_ms == 0 {
        return Err(ScError::config_validation(
            "mcast.config_interval_ms",
            "interval must be > 0",
        ));
    }
    Ok(())
}

fn validate_feed(blueprint: &ScBlueprint) -> Result<(), ScError> {
    let feed = &blueprint.feed;
    if feed.batch_azimuths > feed.azimuths_per_rev {
        return Err(ScError::config_validation(
            "feed.batch_azimuths",
            format!(
                "batch of {} exceeds {} azimuths per revolution",
                feed.batch_azimuths, feed.azimuths_per_rev
            ),
        ));
    }
    for (idx, target) in feed.targets.iter().enumerate() {
        if !(0.0..=feed.end_range_m).contains(&target.range_m) {
            return Err(ScError::config_validation(
                format!("feed.targets[{idx}].range_m"),
                format!("range {} outside 0..={}", target.range_m, feed.end_range_m),
            ));
        }
        if target.extent_m.is_nan() || target.extent_m <= 0.0 {
            return Err(ScError::config_validation(
                format!("feed.targets[{idx}].extent_m"),
                "extent must be > 0",
            ));
        }
    }
    Ok(())
}

fn validate_sinks(blueprint: &ScBlueprint) -> Result<(), ScError> {
    let mut seen = HashSet::new();
    for (idx, sink) in blueprint.sinks.iter().enumerate() {
        if sink.name.is_empty() {
            return Err(ScError::config_validation(
                format!("sinks[{idx}].name"),
                "sink name cannot be empty",
            ));
        }
        if !seen.insert(sink.name.as_str()) {
            return Err(ScError::config_validation(
                format!("sinks[name={}]", sink.name),
                "duplicate sink name",
            ));
        }
        if sink.queue_capacity == 0 {
            return Err(ScError::config_validation(
                format!("sinks[{}].queue_capacity", sink.name),
                "queue_capacity must be > 0",
            ));
        }
        if sink.sink_type == SinkType::File && !sink.params.contains_key("path") {
            return Err(ScError::config_validation(
                format!("sinks[{}].params.path", sink.name),
                "file sink requires a path",
            ));
        }
    }
    Ok(())
}

fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr, ScError> {
    value
        .parse()
        .map_err(|_| ScError::config_validation(field, format!("'{value}' is not an IPv4 address")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{McastConfig, SinkConfig, TargetConfig, View, WinGeom};

    fn minimal_blueprint() -> ScBlueprint {
        ScBlueprint::with_window(512, 512, WinGeom::new(0, 0, 256, 256))
    }

    fn message(bp: &ScBlueprint) -> String {
        validate(bp).unwrap_err().to_string()
    }

    #[test]
    fn valid_config() {
        assert!(validate(&minimal_blueprint()).is_ok());
    }

    #[test]
    fn window_larger_than_display() {
        let mut bp = minimal_blueprint();
        bp.scan.window = WinGeom::new(0, 0, 600, 100);
        assert!(message(&bp).contains("scan.window"));
    }

    #[test]
    fn zero_view_rejected() {
        let mut bp = minimal_blueprint();
        bp.scan.view = View::new(0.0, 0.0, 0.0, 100.0);
        assert!(message(&bp).contains("scan.view"));
    }

    #[test]
    fn pim_azimuths_must_be_power_of_two() {
        let mut bp = minimal_blueprint();
        bp.scan.pim_azimuths = 1000;
        assert!(message(&bp).contains("power of two"));
    }

    #[test]
    fn ssc_threshold_within_window() {
        let mut bp = minimal_blueprint();
        bp.scan.ssc.window_length = 3;
        bp.scan.ssc.window_threshold = 5;
        assert!(message(&bp).contains("window_threshold"));
    }

    #[test]
    fn too_many_trail_ranges() {
        let mut bp = minimal_blueprint();
        bp.scan.true_trails.ranges = vec![100.0; 5];
        assert!(validate(&bp).is_err());
        bp.scan.true_trails.ranges = vec![100.0, -1.0];
        assert!(message(&bp).contains("ranges[1]"));
    }

    #[test]
    fn derived_range_rule_reported() {
        let mut bp = minimal_blueprint();
        bp.scan.scale_factor = 9;
        let err = validate(&bp).unwrap_err();
        assert!(matches!(err, ScError::ConfigValidation { .. }));
    }

    #[test]
    fn mcast_group_must_be_multicast() {
        let mut bp = minimal_blueprint();
        bp.mcast = Some(McastConfig {
            group: "10.0.0.1".into(),
            port: 4378,
            interface: "0.0.0.0".into(),
            window_id: 1,
            config_interval_ms: 1000,
        });
        assert!(message(&bp).contains("mcast.group"));
        if let Some(m) = bp.mcast.as_mut() {
            m.group = "239.1.2.3".into();
        }
        assert!(validate(&bp).is_ok());
    }

    #[test]
    fn bad_server_host() {
        let mut bp = minimal_blueprint();
        bp.net.server_host = "not-an-ip".into();
        assert!(message(&bp).contains("net.server_host"));
    }

    #[test]
    fn target_beyond_range() {
        let mut bp = minimal_blueprint();
        bp.feed.targets.push(TargetConfig {
            range_m: bp.feed.end_range_m * 2.0,
            bearing_deg: 0.0,
            extent_m: 100.0,
            level: 200,
            speed_mps: 0.0,
            course_deg: 0.0,
        });
        assert!(message(&bp).contains("targets[0]"));
    }

    #[test]
    fn duplicate_and_incomplete_sinks() {
        let mut bp = minimal_blueprint();
        let log = SinkConfig {
            name: "log".into(),
            sink_type: SinkType::Log,
            queue_capacity: 10,
            params: Default::default(),
        };
        bp.sinks = vec![log.clone(), log];
        assert!(message(&bp).contains("duplicate sink name"));

        bp.sinks = vec![SinkConfig {
            name: "rec".into(),
            sink_type: SinkType::File,
            queue_capacity: 10,
            params: Default::default(),
        }];
        assert!(message(&bp).contains("requires a path"));

        bp.sinks[0].name = String::new();
        assert!(message(&bp).contains("cannot be empty"));
    }
}
