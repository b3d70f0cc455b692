//! 简单增强: 平面转置与各轴翻转.
//!
//! 增强码共 4 位, 依次检查: 第 2 位转置两个平面轴, 第 0 位翻转轴 0, 第 1 位翻转轴 1,
//! 第 3 位翻转 z 轴. 全部操作只改变视图的步长, 不拷贝数据.

use crate::consts::NAUGS;
use ndarray::{ArrayView, Axis, Dimension};
use rand::Rng;

/// 对补丁视图施加增强码 `code`.
///
/// 二维补丁 (单个 z 切片) 忽略 z 翻转位.
///
/// # 注意
///
/// `code == 0` 时原样返回输入视图.
pub fn augment<'a, T, D: Dimension>(mut v: ArrayView<'a, T, D>, code: u8) -> ArrayView<'a, T, D> {
    if code == 0 {
        return v;
    }
    if code & 4 != 0 {
        v.swap_axes(0, 1);
    }
    if code & 1 != 0 {
        v.invert_axis(Axis(0));
    }
    if code & 2 != 0 {
        v.invert_axis(Axis(1));
    }
    if code & 8 != 0 && v.ndim() > 2 {
        v.invert_axis(Axis(2));
    }
    v
}

/// 抽取一个随机增强码, 只保留 `mask` 中的位.
#[inline]
pub fn random_code<R: Rng + ?Sized>(rng: &mut R, mask: u8) -> u8 {
    rng.gen_range(0..NAUGS) & mask
}
