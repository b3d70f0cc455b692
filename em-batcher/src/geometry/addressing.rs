//! 块坐标到体素坐标的换算.
//!
//! 存储按块组织. 一个区域由 "块坐标 + 块内体素偏移" 描述, 这里把它换算成存储中的绝对体素坐标.
//! 本模块中的函数都是纯函数, 不检查越界: 越界由存储层在实际读取时报告.

use std::ops::Range;

/// 由块坐标和偏移计算绝对体素起点.
///
/// `shape` 与 `chunks` 是存储声明的数据集形状与块形状 (存储轴序).
/// `chunk_index` 与 `offset` 是原始轴序 (未重切片, 行优先) 下的块坐标和体素偏移.
/// 返回值始终是原始轴序下的绝对体素坐标.
///
/// # 注意
///
/// 1. `origin_centered` 为真时, 块 0 位于体中心, 块坐标可以为负.
///   映射为 `ci + n / 2 + n % 2 - 1`, 其中 `n` 为该轴的块数.
/// 2. `c_order` 为假时存储按列优先声明, 块坐标会先逆序到存储轴序再乘以块形状, 结果再逆序回来.
pub fn hdf_index_from_chunk_index(
    shape: [usize; 3],
    chunks: [usize; 3],
    chunk_index: [i64; 3],
    offset: [usize; 3],
    origin_centered: bool,
    c_order: bool,
) -> [i64; 3] {
    let ci = if c_order {
        chunk_index
    } else {
        reversed(chunk_index)
    };
    let mut begin = [0i64; 3];
    for d in 0..3 {
        let n = (shape[d] / chunks[d]) as i64;
        let c = if origin_centered {
            ci[d] + n / 2 + n % 2 - 1
        } else {
            ci[d]
        };
        begin[d] = c * chunks[d] as i64;
    }
    if !c_order {
        begin = reversed(begin);
    }
    for d in 0..3 {
        begin[d] += offset[d] as i64;
    }
    begin
}

/// 逆序一个 3 维向量.
#[inline]
pub fn reversed<T: Copy>(v: [T; 3]) -> [T; 3] {
    [v[2], v[1], v[0]]
}

/// 存储中一个左闭右开的长方体区域.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Region {
    /// 起点 (含).
    pub begin: [i64; 3],

    /// 终点 (不含).
    pub end: [i64; 3],
}

impl Region {
    /// 由起点和大小构造.
    #[inline]
    pub fn from_size(begin: [i64; 3], size: [usize; 3]) -> Self {
        Self {
            begin,
            end: [
                begin[0] + size[0] as i64,
                begin[1] + size[1] as i64,
                begin[2] + size[2] as i64,
            ],
        }
    }

    /// 区域大小. 终点小于起点的维度视为 0.
    #[inline]
    pub fn size(&self) -> [usize; 3] {
        [0, 1, 2].map(|d| (self.end[d] - self.begin[d]).max(0) as usize)
    }

    /// 区域体素数.
    #[inline]
    pub fn len(&self) -> usize {
        self.size().iter().product()
    }

    /// 区域是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 在轴 `axis` 上对称扩展 `by` 个体素.
    #[inline]
    pub fn expand(mut self, axis: usize, by: usize) -> Self {
        self.begin[axis] -= by as i64;
        self.end[axis] += by as i64;
        self
    }

    /// 从原始轴序转换为存储轴序. 列优先存储需要逆序.
    #[inline]
    pub fn to_storage(self, c_order: bool) -> Self {
        if c_order {
            self
        } else {
            Self {
                begin: reversed(self.begin),
                end: reversed(self.end),
            }
        }
    }
}

/// 数据读取区域: 在规范轴序的两个平面轴上各扩展 `image_size / 2`, z 轴上扩展 `nzslices / 2`.
///
/// `begin` 与 `size` 为原始轴序; `perm` 为重切片置换表, 规范轴 `k` 对应原始轴 `perm[k]`.
pub fn data_region(
    begin: [i64; 3],
    size: [usize; 3],
    perm: [usize; 3],
    image_size: usize,
    nzslices: usize,
) -> Region {
    Region::from_size(begin, size)
        .expand(perm[0], image_size / 2)
        .expand(perm[1], image_size / 2)
        .expand(perm[2], nzslices / 2)
}

/// 分割标签读取区域: 各轴扩展 `border` (规范轴序), z 轴再扩展 `nzslices / 2`.
pub fn label_region(
    begin: [i64; 3],
    size: [usize; 3],
    perm: [usize; 3],
    border: [usize; 3],
    nzslices: usize,
) -> Region {
    Region::from_size(begin, size)
        .expand(perm[0], border[0])
        .expand(perm[1], border[1])
        .expand(perm[2], border[2] + nzslices / 2)
}

/// 立方体内的 z 目标范围: 随机区在 `[0, nrand)`, 平铺区紧随其后.
#[inline]
pub fn dst_z_range(tiled: bool, nrand_zslice: usize, ntotal_zslice: usize) -> Range<usize> {
    if tiled {
        nrand_zslice..ntotal_zslice
    } else {
        0..nrand_zslice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: [usize; 3] = [640, 512, 384];
    const CHUNKS: [usize; 3] = [128, 128, 128];

    #[test]
    fn test_corner_relative() {
        let ind = hdf_index_from_chunk_index(SHAPE, CHUNKS, [2, 1, 0], [8, 0, 4], false, true);
        assert_eq!(ind, [264, 128, 4]);
    }

    /// 以体中心为原点时, 块 0 在奇数块数的轴上恰好是中间块.
    #[test]
    fn test_origin_centered() {
        // nchunks = (5, 4, 3)
        let ind = hdf_index_from_chunk_index(SHAPE, CHUNKS, [0, 0, 0], [0, 0, 0], true, true);
        assert_eq!(ind, [2 * 128, 128, 128]);
        let ind = hdf_index_from_chunk_index(SHAPE, CHUNKS, [-2, -1, 1], [0, 0, 0], true, true);
        assert_eq!(ind, [0, 0, 256]);
    }

    /// 列优先存储: 存储声明逆序, 结果仍为原始轴序.
    #[test]
    fn test_f_order_matches_c_order() {
        let c = hdf_index_from_chunk_index(SHAPE, CHUNKS, [3, 2, 1], [5, 6, 7], true, true);
        let f = hdf_index_from_chunk_index(
            reversed(SHAPE),
            reversed(CHUNKS),
            [3, 2, 1],
            [5, 6, 7],
            true,
            false,
        );
        assert_eq!(c, f);
    }

    #[test]
    fn test_data_region() {
        // 规范 (x, z, y) 对应 perm [0, 2, 1].
        let r = data_region([100, 200, 300], [32, 16, 8], [0, 2, 1], 9, 3);
        assert_eq!(r.begin, [96, 199, 296]);
        assert_eq!(r.end, [136, 217, 312]);
        assert_eq!(r.size(), [40, 18, 16]);
        assert_eq!(r.to_storage(false).begin, [296, 199, 96]);
    }

    #[test]
    fn test_label_region() {
        let r = label_region([10, 10, 10], [4, 4, 4], [0, 1, 2], [1, 1, 0], 3);
        assert_eq!(r.begin, [9, 9, 9]);
        assert_eq!(r.size(), [6, 6, 6]);
    }

    #[test]
    fn test_dst_z_range() {
        assert_eq!(dst_z_range(false, 10, 14), 0..10);
        assert_eq!(dst_z_range(true, 10, 14), 10..14);
    }
}
