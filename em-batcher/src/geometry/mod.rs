//! 几何描述.
//!
//! 由配置一次性推导出的全部尺寸常量. 除非特别说明, 所有 3 维量都是规范 (重切片后) 轴序.

pub mod addressing;
mod reorder;

pub use addressing::{hdf_index_from_chunk_index, Region};
pub use reorder::DimOrdering;

use crate::config::{ConfigError, ParserConfig};
use std::ops::Range;

/// 批次生成的几何常量.
///
/// # 注意
///
/// 1. `tile_size` 不参与重切片, 其余尺寸向量在构造时重切片一次.
/// 2. 立方体在 z 方向上先放随机区 (`[0, nrand_zslice)`), 再放平铺区 (`[nrand_zslice, ntotal_zslice)`).
/// 3. 数据立方体在平面上比标签立方体多出输入补丁的边缘, 两者由 `labels_offset` 对齐.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// 重切片轴序.
    pub ordering: DimOrdering,
    /// 输入补丁边长.
    pub image_size: usize,
    /// 输出补丁边长.
    pub image_out_size: usize,
    /// 每个样本的 z 切片数.
    pub nzslices: usize,
    /// 平铺批次形状, 以输出补丁计.
    pub tile_size: [usize; 3],
    /// 随机区大小.
    pub size_rand: [usize; 3],
    /// 平铺区 z 切片数.
    pub nz_tiled: usize,
    /// 独立标注子块大小.
    pub read_size: [usize; 3],
    /// 随机采样排除的子块边界, 已计入输出补丁半径与随机平移半径.
    pub read_border: [usize; 3],
    /// 查表采样的输出补丁随机平移窗口边长.
    pub image_out_offset: usize,
    /// 分割标签立方体在平面上的对称边界.
    pub label_border: usize,

    /// 每批次的样本数.
    pub num_cases_per_batch: usize,
    /// 一个平铺批次覆盖的体素形状.
    pub shape_per_batch: [usize; 3],
    /// 随机区加平铺区的总大小.
    pub size_total: [usize; 3],
    /// 每个 z 切片在平面上的平铺块数.
    pub tiles_per_zslice: [usize; 2],
    /// 每个样本的输入像素数.
    pub pixels_per_image: usize,
    /// 每个样本的输出像素数.
    pub pixels_per_out_image: usize,
    /// 随机区缓冲的 z 切片数.
    pub nrand_zslice: usize,
    /// 平铺区缓冲的 z 切片数.
    pub ntiled_zslice: usize,
    /// 缓冲的 z 切片总数.
    pub ntotal_zslice: usize,
    /// 平铺区大小.
    pub size_tiled: [usize; 3],
    /// 数据立方体大小.
    pub data_slice_size: [usize; 3],
    /// 标签立方体大小.
    pub labels_slice_size: [usize; 3],
    /// 带边界的分割标签立方体大小.
    pub seg_labels_slice_size: [usize; 3],
    /// 标签坐标到数据坐标的偏移.
    pub labels_offset: [usize; 3],
    /// 每个 z 切片的平铺批次数.
    pub batches_per_zslice: usize,
    /// 每个 z 切片的平铺索引数.
    pub num_inds_tiled: usize,
    /// 每个平铺批次的 z 切片数.
    pub zslices_per_batch: usize,
    /// 一个随机区立方体对应的平铺批次数.
    pub batches_per_rand_cube: usize,
    /// 输出概率体大小 (输出像素空间).
    pub output_size: [usize; 3],
    /// 分割上下文补丁边长.
    pub seg_out_size: usize,
    /// 分割上下文补丁像素数.
    pub pixels_per_seg_out: usize,
}

impl Geometry {
    /// 从配置推导几何常量, 检查全部尺寸约束.
    ///
    /// `label_border` 由标签方案决定, 见 `LabelSetup::border`.
    pub fn new(cfg: &ParserConfig, label_border: usize) -> Result<Self, ConfigError> {
        let ordering = cfg.dim_ordering;
        let image_size = cfg.image_size;
        let image_out_size = cfg.image_out_size;
        let nzslices = cfg.nzslices;

        if nzslices != 1 && nzslices != 3 {
            return Err(ConfigError::InvalidZSlices(nzslices));
        }
        if image_size == 0 || image_out_size == 0 {
            return Err(ConfigError::ZeroSize("image_size"));
        }
        if image_size % 2 != image_out_size % 2 {
            return Err(ConfigError::ParityMismatch {
                image_size,
                image_out_size,
            });
        }
        if !cfg.independent_labels && image_out_size != 1 {
            return Err(ConfigError::MultiPixelNeedsIndependent(image_out_size));
        }
        if cfg.tile_size.contains(&0) {
            return Err(ConfigError::ZeroSize("tile_size"));
        }
        if cfg.size_rand.contains(&0) {
            return Err(ConfigError::ZeroSize("size_rand"));
        }

        let size_rand = ordering.apply(cfg.size_rand);
        let tile_size = cfg.tile_size;
        let nz_tiled = if cfg.nz_tiled < 0 {
            size_rand[2]
        } else {
            cfg.nz_tiled as usize
        };

        let num_cases_per_batch = tile_size.iter().product();
        let shape_per_batch = [
            tile_size[0] * image_out_size,
            tile_size[1] * image_out_size,
            tile_size[2],
        ];
        let size_total = [size_rand[0], size_rand[1], size_rand[2] + nz_tiled];
        if (0..3).any(|d| size_total[d] % shape_per_batch[d] != 0) {
            return Err(ConfigError::NotDivisible {
                what: "size_total by shape_per_batch",
                size: size_total,
                by: shape_per_batch,
            });
        }
        let tiles_per_zslice = [
            size_rand[0] / shape_per_batch[0],
            size_rand[1] / shape_per_batch[1],
        ];

        let nrand_zslice = size_rand[2] + nzslices - 1;
        let ntiled_zslice = nz_tiled + nzslices - 1;
        let ntotal_zslice = nrand_zslice + ntiled_zslice;
        let size_tiled = [size_rand[0], size_rand[1], nz_tiled];
        let pad = if image_size % 2 == 1 {
            image_size - 1
        } else {
            image_size
        };
        let data_slice_size = [size_rand[0] + pad, size_rand[1] + pad, ntotal_zslice];
        let labels_slice_size = [size_rand[0], size_rand[1], ntotal_zslice];
        let seg_labels_slice_size = [
            size_rand[0] + 2 * label_border,
            size_rand[1] + 2 * label_border,
            ntotal_zslice,
        ];
        let labels_offset = [image_size / 2, image_size / 2, 0];

        let batches_per_zslice = tiles_per_zslice[0] * tiles_per_zslice[1];
        let num_inds_tiled = num_cases_per_batch * batches_per_zslice;
        let zslices_per_batch = tile_size[2];
        let layout_ok = (batches_per_zslice == 1 && zslices_per_batch >= 1)
            || (batches_per_zslice > 1 && zslices_per_batch == 1);
        if !layout_ok {
            return Err(ConfigError::TileLayout {
                batches_per_zslice,
                zslices_per_batch,
            });
        }
        let batches_per_rand_cube = nrand_zslice * batches_per_zslice / zslices_per_batch;

        let seg_out_size = image_out_size + 2 * label_border;

        let read_size = match cfg.read_size {
            Some(r) => ordering.apply(r),
            None => size_rand,
        };
        if read_size.contains(&0) {
            return Err(ConfigError::ZeroSize("read_size"));
        }
        if (0..3).any(|d| size_rand[d] % read_size[d] != 0) {
            return Err(ConfigError::NotDivisible {
                what: "size_rand by read_size",
                size: size_rand,
                by: read_size,
            });
        }
        let mut read_border = ordering.apply(cfg.read_border);
        read_border[0] += image_out_size / 2;
        read_border[1] += image_out_size / 2;
        if !cfg.no_label_lookup {
            read_border[0] += cfg.image_out_offset / 2;
            read_border[1] += cfg.image_out_offset / 2;
        }

        let output_size = [
            labels_slice_size[0] / image_out_size,
            labels_slice_size[1] / image_out_size,
            labels_slice_size[2],
        ];

        Ok(Self {
            ordering,
            image_size,
            image_out_size,
            nzslices,
            tile_size,
            size_rand,
            nz_tiled,
            read_size,
            read_border,
            image_out_offset: cfg.image_out_offset,
            label_border,
            num_cases_per_batch,
            shape_per_batch,
            size_total,
            tiles_per_zslice,
            pixels_per_image: nzslices * image_size * image_size,
            pixels_per_out_image: image_out_size * image_out_size,
            nrand_zslice,
            ntiled_zslice,
            ntotal_zslice,
            size_tiled,
            data_slice_size,
            labels_slice_size,
            seg_labels_slice_size,
            labels_offset,
            batches_per_zslice,
            num_inds_tiled,
            zslices_per_batch,
            batches_per_rand_cube,
            output_size,
            seg_out_size,
            pixels_per_seg_out: seg_out_size * seg_out_size,
        })
    }

    /// 是否有平铺区.
    #[inline]
    pub fn has_tiled(&self) -> bool {
        self.nz_tiled > 0
    }

    /// 随机区的 z 范围内, 去除 `nzslices / 2` 边缘后可作为样本中心的切片.
    #[inline]
    pub fn rand_z_centres(&self) -> Range<usize> {
        self.nzslices / 2..self.nrand_zslice - self.nzslices / 2
    }

    /// 在原始轴序下, 从区域起点出发的数据读取区域.
    pub fn data_region(&self, begin: [i64; 3], tiled: bool) -> Region {
        let size = if tiled { self.size_tiled } else { self.size_rand };
        addressing::data_region(
            begin,
            self.ordering.apply(size),
            self.ordering.perm(),
            self.image_size,
            self.nzslices,
        )
    }

    /// 在原始轴序下, 从区域起点出发的分割标签读取区域.
    pub fn label_region(&self, begin: [i64; 3], tiled: bool) -> Region {
        let size = if tiled { self.size_tiled } else { self.size_rand };
        addressing::label_region(
            begin,
            self.ordering.apply(size),
            self.ordering.perm(),
            [self.label_border, self.label_border, 0],
            self.nzslices,
        )
    }

    /// 立方体内的 z 目标范围.
    #[inline]
    pub fn dst_z_range(&self, tiled: bool) -> Range<usize> {
        addressing::dst_z_range(tiled, self.nrand_zslice, self.ntotal_zslice)
    }
}
