//! 配置解析模块
//!
//! 支持 TOML (主要) 和 JSON 格式。

use contracts::{ScBlueprint, ScError};

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML 格式 (推荐)
    Toml,
    Json,
}

impl ConfigFormat {
    /// 从文件扩展名推断格式
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

pub fn parse_toml(content: &str) -> Result<ScBlueprint, ScError> {
    toml::from_str(content).map_err(|e| ScError::ConfigParse {
        message: format!("TOML parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

pub fn parse_json(content: &str) -> Result<ScBlueprint, ScError> {
    serde_json::from_str(content).map_err(|e| ScError::ConfigParse {
        message: format!("JSON parse error: {e}"),
        source: Some(Box::new(e)),
    })
}

pub fn parse(content: &str, format: ConfigFormat) -> Result<ScBlueprint, ScError> {
    match format {
        ConfigFormat::Toml => parse_toml(content),
        ConfigFormat::Json => parse_json(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{FadeType, ScType};

    #[test]
    fn parse_toml_minimal() {
        let content = r#"
[display]
max_width = 512
max_height = 512

[scan]
window = { x = 0, y = 0, w = 256, h = 256 }

[scan.fade]
fade_type = "sweep"
rate = 20
"#;
        let bp = parse_toml(content).unwrap();
        assert_eq!(bp.display.max_width, 512);
        assert_eq!(bp.scan.window.w, 256);
        assert_eq!(bp.scan.fade.fade_type, FadeType::Sweep);
        assert_eq!(bp.scan.sc_type, ScType::Ppi);
        assert!(bp.mcast.is_none());
    }

    #[test]
    fn parse_json_minimal() {
        let content = r#"{
            "display": { "max_width": 128, "max_height": 64 },
            "scan": { "window": { "x": 0, "y": 0, "w": 128, "h": 64 } },
            "sinks": [{ "name": "log", "sink_type": "log" }]
        }"#;
        let bp = parse_json(content).unwrap();
        assert_eq!(bp.sinks.len(), 1);
        assert_eq!(bp.net.command_port, 4377);
    }

    #[test]
    fn parse_toml_syntax_error() {
        let err = parse_toml("invalid toml [[[").unwrap_err();
        assert!(matches!(err, ScError::ConfigParse { .. }));
    }

    #[test]
    fn missing_scan_section_is_a_parse_error() {
        let err = parse_toml("[display]\nmax_width = 1\nmax_height = 1\n").unwrap_err();
        assert!(matches!(err, ScError::ConfigParse { .. }));
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(ConfigFormat::from_extension("toml"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_extension("TOML"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_extension("json"), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_extension("yaml"), None);
    }
}
