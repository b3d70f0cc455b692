//! 逐样本提取.
//!
//! 批次缓冲区按 `[每样本元素数, 样本数]` 排列, 每个样本占一列. 各样本只读取立方体,
//! 彼此独立, 打开 `rayon` feature 时按列并行.

use crate::augment::augment;
use crate::geometry::Geometry;
use crate::labels::{LabelSetup, UNSELECTABLE};
use crate::Idx3d;
use ndarray::{s, Array2, Array3, ArrayView1, ArrayViewMut1, Zip};

/// 一个样本: 数据立方体坐标与增强码.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Case {
    pub pos: Idx3d,
    pub aug: u8,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        fn for_each_column<T, F>(out: &mut Array2<T>, cases: &[Case], op: F)
        where
            T: Send,
            F: Fn(ArrayViewMut1<T>, &Case) + Sync + Send,
        {
            Zip::from(out.columns_mut())
                .and(ArrayView1::from(cases))
                .par_for_each(op);
        }

        fn for_each_column_pair<T, U, F>(a: &mut Array2<T>, b: &mut Array2<U>, cases: &[Case], op: F)
        where
            T: Send,
            U: Send,
            F: Fn(ArrayViewMut1<T>, ArrayViewMut1<U>, &Case) + Sync + Send,
        {
            Zip::from(a.columns_mut())
                .and(b.columns_mut())
                .and(ArrayView1::from(cases))
                .par_for_each(op);
        }
    } else {
        fn for_each_column<T, F>(out: &mut Array2<T>, cases: &[Case], op: F)
        where
            F: Fn(ArrayViewMut1<T>, &Case),
        {
            Zip::from(out.columns_mut())
                .and(ArrayView1::from(cases))
                .for_each(op);
        }

        fn for_each_column_pair<T, U, F>(a: &mut Array2<T>, b: &mut Array2<U>, cases: &[Case], op: F)
        where
            F: Fn(ArrayViewMut1<T>, ArrayViewMut1<U>, &Case),
        {
            Zip::from(a.columns_mut())
                .and(b.columns_mut())
                .and(ArrayView1::from(cases))
                .for_each(op);
        }
    }
}

/// 把每个样本的输入补丁写入 `out`.
///
/// 补丁以样本坐标为中心, 增强后转置为 `(z, x, y)` 并按行优先展开,
/// 使每个 z 切片 (通道) 连续.
pub(crate) fn fill_images(cube: &Array3<f32>, g: &Geometry, cases: &[Case], out: &mut Array2<f32>) {
    let (is, nz) = (g.image_size, g.nzslices);
    let (h, hz) = (is / 2, nz / 2);
    for_each_column(out, cases, |mut col, case| {
        let (x, y, z) = case.pos;
        let patch = cube.slice(s![x - h..x - h + is, y - h..y - h + is, z - hz..z - hz + nz]);
        let patch = augment(patch, case.aug).permuted_axes([2, 0, 1]);
        col.iter_mut().zip(patch.iter()).for_each(|(d, &v)| *d = v);
    });
}

/// 标签提取所需的只读状态.
pub(crate) struct LabelSource<'a> {
    pub setup: &'a LabelSetup,
    pub select: &'a Array3<u8>,
    pub seg: &'a Array3<u32>,
    pub ecs: u32,
}

/// 把每个样本的网络目标与分割上下文分别写入 `labels` 和 `seg`.
///
/// # 注意
///
/// 1. 分割上下文总是带边界的分割立方体中 `seg_out_size` 见方的增强补丁.
/// 2. 互斥标签直接取中心体素的选择标签. 未标注体素不进查找表, 但均匀与平铺采样仍可能
///   落在其上, 此时按 [`LabelSetup::target_label`] 计算目标, 保证目标总小于标签个数.
/// 3. 独立标签在同一补丁的中心区域计算目标.
pub(crate) fn fill_labels(
    src: &LabelSource,
    g: &Geometry,
    cases: &[Case],
    labels: &mut Array2<f32>,
    seg: &mut Array2<u32>,
) {
    let off = g.labels_offset;
    let b = src.setup.border();
    let so = g.seg_out_size;
    let independent = src.setup.independent();
    for_each_column_pair(labels, seg, cases, |mut lcol, mut scol, case| {
        let (x, y, z) = case.pos;
        let (x, y) = (x - off[0], y - off[1]);
        let (sx, sy) = (x + b - so / 2, y + b - so / 2);
        let patch = src.seg.slice(s![sx..sx + so, sy..sy + so, z]);
        let patch = augment(patch, case.aug);
        scol.iter_mut().zip(patch.iter()).for_each(|(d, &v)| *d = v);
        if independent {
            src.setup.indep_targets(patch, src.ecs, lcol);
        } else {
            lcol[0] = match src.select[(x, y, z)] {
                UNSELECTABLE => src.setup.target_label(src.seg, src.ecs, (x, y, z)),
                l => l,
            } as f32;
        }
    });
}
