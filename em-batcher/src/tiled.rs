//! 平铺索引.
//!
//! 平铺批次按固定顺序覆盖整个 z 切片. 同一顺序用于把网络输出散射回概率体,
//! 因此正向与逆向索引必须由同一处生成.

use crate::error::EmResult;
use crate::geometry::Geometry;
use crate::lookup::compact;
use crate::{Idx3d, Idx3dU16};
use itertools::iproduct;

/// 平铺索引.
///
/// 正向索引给出数据立方体坐标 (z 为相对于批次起始切片的偏移),
/// 逆向索引给出输出像素坐标.
///
/// # 注意
///
/// 顺序由慢到快依次为: 批次内 z, y 方向平铺块, x 方向平铺块, 块内 x, 块内 y.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TiledIndex {
    forward: Vec<Idx3dU16>,
    inverse: Vec<Idx3dU16>,
    cases_per_batch: usize,
}

impl TiledIndex {
    /// 根据几何常量生成.
    pub fn new(g: &Geometry) -> EmResult<Self> {
        let ios = g.image_out_size;
        let off = g.labels_offset;
        let [tpx, tpy] = g.tiles_per_zslice;
        let [tsx, tsy, tsz] = g.tile_size;

        let forward = iproduct!(0..tsz, 0..tpy, 0..tpx, 0..tsx, 0..tsy)
            .map(|(z, ty, tx, px, py)| {
                let x = off[0] + tx * g.shape_per_batch[0] + ios / 2 + px * ios;
                let y = off[1] + ty * g.shape_per_batch[1] + ios / 2 + py * ios;
                compact((x, y, z))
            })
            .collect::<EmResult<Vec<_>>>()?;
        let inverse = forward
            .iter()
            .map(|&(x, y, z)| {
                (
                    (x - off[0] as u16) / ios as u16,
                    (y - off[1] as u16) / ios as u16,
                    z,
                )
            })
            .collect();
        Ok(Self {
            forward,
            inverse,
            cases_per_batch: g.num_cases_per_batch,
        })
    }

    /// 索引总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// 全部正向索引.
    #[inline]
    pub fn forward(&self) -> &[Idx3dU16] {
        &self.forward
    }

    /// 全部逆向索引.
    #[inline]
    pub fn inverse(&self) -> &[Idx3dU16] {
        &self.inverse
    }

    /// 从 `ind0` 开始的一个批次的正向索引, z 加上 `zslice`.
    pub fn batch(&self, ind0: usize, zslice: usize) -> impl Iterator<Item = Idx3d> + '_ {
        self.forward[ind0..ind0 + self.cases_per_batch]
            .iter()
            .map(move |&(x, y, z)| (x as usize, y as usize, z as usize + zslice))
    }

    /// 从 `ind0` 开始的一个批次的逆向索引.
    #[inline]
    pub fn batch_inverse(&self, ind0: usize) -> &[Idx3dU16] {
        &self.inverse[ind0..ind0 + self.cases_per_batch]
    }
}
