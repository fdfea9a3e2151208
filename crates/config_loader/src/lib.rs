//! # Config Loader
//!
//! 配置加载与解析模块。
//!
//! 职责：
//! - 解析 TOML/JSON 配置文件
//! - 校验配置合法性
//! - 生成 `ScBlueprint`
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let blueprint = ConfigLoader::load_from_path(Path::new("scconv.toml")).unwrap();
//! println!("window: {:?}", blueprint.scan.window);
//! ```

mod parser;
mod validator;

pub use contracts::ScBlueprint;
pub use parser::ConfigFormat;

use contracts::ScError;
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from a file; the format follows the extension (.toml / .json)
    pub fn load_from_path(path: &Path) -> Result<ScBlueprint, ScError> {
        let format = Self::detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content, format)
    }

    pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<ScBlueprint, ScError> {
        let blueprint = parser::parse(content, format)?;
        validator::validate(&blueprint)?;
        Ok(blueprint)
    }

    /// Validate a blueprint built in code
    pub fn validate(blueprint: &ScBlueprint) -> Result<(), ScError> {
        validator::validate(blueprint)
    }

    pub fn to_toml(blueprint: &ScBlueprint) -> Result<String, ScError> {
        toml::to_string_pretty(blueprint)
            .map_err(|e| ScError::config_parse(format!("TOML serialize error: {e}")))
    }

    pub fn to_json(blueprint: &ScBlueprint) -> Result<String, ScError> {
        serde_json::to_string_pretty(blueprint)
            .map_err(|e| ScError::config_parse(format!("JSON serialize error: {e}")))
    }

    fn detect_format(path: &Path) -> Result<ConfigFormat, ScError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| ScError::config_parse("cannot determine file format from extension"))?;
        ConfigFormat::from_extension(ext)
            .ok_or_else(|| ScError::config_parse(format!("unsupported config format: .{ext}")))
    }
}
