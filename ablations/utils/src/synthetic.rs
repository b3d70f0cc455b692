//! 合成体数据.
//!
//! 没有真实数据集时, 用一个由球形 "细胞" 组成的体代替, 分割标签与强度一一对应.

use em_batcher::store::{MemStore, StoreError};
use ndarray::Array3;

/// 合成数据集名称.
pub const DATA: &str = "data";

/// 合成分割标签数据集名称.
pub const LABELS: &str = "labels";

/// 细胞中心的网格间距.
const SPACING: usize = 12;

/// 细胞半径的平方.
const RADIUS2: usize = 16;

/// 体素所属的细胞编号. 细胞之间的体素为膜 (0).
fn cell_of(x: usize, y: usize, z: usize) -> u32 {
    let nearest = |c: usize| c / SPACING * SPACING + SPACING / 2;
    let (cx, cy, cz) = (nearest(x), nearest(y), nearest(z));
    let d2 = x.abs_diff(cx).pow(2) + y.abs_diff(cy).pow(2) + z.abs_diff(cz).pow(2);
    if d2 > RADIUS2 {
        return 0;
    }
    let n = |c: usize| (c / SPACING) as u32;
    1 + n(x) + 97 * n(y) + 97 * 97 * n(z)
}

/// 形状为 `shape`, 存储块为 `chunks` 的合成体.
///
/// 膜的强度为 0.2, 细胞内部为 0.8, 外加一个随 `(x + y + z)` 缓慢变化的偏置.
pub fn cell_store(shape: [usize; 3], chunks: [usize; 3]) -> Result<MemStore, StoreError> {
    let labels = Array3::from_shape_fn(shape, |(x, y, z)| cell_of(x, y, z));
    let data = Array3::from_shape_fn(shape, |(x, y, z)| {
        let base = if labels[(x, y, z)] == 0 { 0.2 } else { 0.8 };
        base + ((x + y + z) % 7) as f32 * 0.01
    });
    let mut st = MemStore::new();
    st.insert_data(DATA, data, chunks)?;
    st.insert_labels(LABELS, labels, chunks)?;
    Ok(st)
}
