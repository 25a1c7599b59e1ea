use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
/// 避免使用硬编码相对路径，确保在不同构建环境下路径一致。
///
/// # 使用示例
/// ```ignore
/// let settings = TruvisPath::config_path("frame_settings.toml"); // config/frame_settings.toml
/// ```
pub struct TruvisPath {}
impl TruvisPath {
    /// 获取 `config/` 目录下的文件路径
    pub fn config_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }

    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        // engine/crates/truvis-crate-tools -> engine/crates -> engine -> workspace root
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.ancestors().nth(3).unwrap_or(manifest_dir).to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_path_contains_engine() {
        let workspace = TruvisPath::workspace_path();
        assert!(workspace.join("engine").join("crates").join("truvis-crate-tools").exists());
    }

    #[test]
    fn test_config_path() {
        let path = TruvisPath::config_path("frame_settings.toml");
        assert!(path.ends_with("config/frame_settings.toml"));
    }
}
