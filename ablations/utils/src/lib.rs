//! 消融实验依赖的通用组件.

pub mod synthetic;

use em_batcher::store::{NpyDirStore, StoreError};
use std::env;
use std::path::PathBuf;

const SEP: &str = "--------------------------------------------------------";

/// 向 `w` 写一条简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) -> std::io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 获取 EM 体数据目录存储的基本路径.
///
/// 1. 若环境变量 `$EM_STORE_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/em`.
pub fn store_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("EM_STORE_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => {
            let mut ans = dirs::home_dir()?;
            ans.extend(["dataset", "em"]);
            Some(ans)
        }
    }
}

/// 打开 `$EM_STORE_DIR` 或者 `$HOME/dataset/em` 下的目录存储. 目录不存在时返回 `None`.
///
/// 存储中的数据集须与合成体同名, 见 [`synthetic::DATA`] 与 [`synthetic::LABELS`].
pub fn store_from_env_or_home() -> Option<Result<NpyDirStore, StoreError>> {
    let d = store_dir_from_env_or_home()?;
    d.is_dir().then(|| NpyDirStore::open(d))
}
