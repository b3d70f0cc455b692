//! 分块体数据存储.
//!
//! 批次生成器只通过 [`VolumeStore`] 读取数据, 通过 [`VolumeSink`] 写出概率体.
//! 区域坐标一律为存储轴序: 行优先存储即原始轴序, 列优先存储为其逆序.
//!
//! 提供两个实现:
//!
//! 1. [`MemStore`]: 全部数据集驻留内存, 可从 NIfTI 文件导入.
//! 2. [`NpyDirStore`]: 每个数据集对应目录下的一个 `.npy` 文件, 元数据存放在压缩的旁路文件中.

mod memory;

#[cfg(feature = "serde")]
mod npy_dir;

pub use memory::MemStore;

#[cfg(feature = "serde")]
pub use npy_dir::NpyDirStore;

use crate::geometry::Region;
use ndarray::{ArrayView3, ArrayViewMut3};
use std::collections::BTreeMap;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 数据集属性值.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    /// 整数.
    Int(i64),

    /// 浮点数.
    Float(f64),

    /// 字符串.
    Str(String),

    /// 浮点数组.
    FloatVec(Vec<f64>),
}

/// 数据集的全部属性.
pub type Attrs = BTreeMap<String, AttrValue>;

/// 数据集的形状信息 (存储轴序).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DatasetInfo {
    /// 数据集形状.
    pub shape: [usize; 3],

    /// 块形状.
    pub chunks: [usize; 3],
}

/// 存储访问错误.
#[derive(Error, Debug)]
pub enum StoreError {
    /// 数据集不存在.
    #[error("dataset '{0}' does not exist")]
    NoSuchDataset(String),

    /// 读写区域超出数据集范围.
    #[error("region {begin:?}..{end:?} is out of bounds of dataset '{dataset}' with shape {shape:?}")]
    OutOfBounds {
        /// 数据集名称.
        dataset: String,
        /// 区域起点.
        begin: [i64; 3],
        /// 区域终点.
        end: [i64; 3],
        /// 数据集形状.
        shape: [usize; 3],
    },

    /// 目标缓冲区与区域大小不符.
    #[error("destination of shape {dst:?} does not match region size {region:?}")]
    ShapeMismatch {
        /// 目标形状.
        dst: [usize; 3],
        /// 区域大小.
        region: [usize; 3],
    },

    /// 标签与数据的块形状不一致.
    #[error("label chunk shape {labels:?} differs from data chunk shape {data:?}")]
    ChunkMismatch {
        /// 数据块形状.
        data: [usize; 3],
        /// 标签块形状.
        labels: [usize; 3],
    },

    /// 数据集的元素类型不符合用途.
    #[error("dataset '{0}' does not hold segmentation labels")]
    NotLabels(String),

    /// 数据集已存在但形状不同.
    #[error("dataset '{dataset}' already exists with shape {existing:?}, requested {requested:?}")]
    Exists {
        /// 数据集名称.
        dataset: String,
        /// 已有形状.
        existing: [usize; 3],
        /// 请求形状.
        requested: [usize; 3],
    },

    /// 块形状不能整除数据集形状.
    #[error("chunk shape {chunks:?} does not tile shape {shape:?}")]
    BadChunks {
        /// 数据集形状.
        shape: [usize; 3],
        /// 块形状.
        chunks: [usize; 3],
    },

    /// NIfTI 读取错误.
    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    /// 导入的体不是 3 维.
    #[error(transparent)]
    Dimensionality(#[from] ndarray::ShapeError),

    /// 底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 读取 npy 错误.
    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// 写入 npy 错误.
    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    /// 元数据编码错误.
    #[error(transparent)]
    Meta(#[from] bincode::Error),
}

/// 只读分块体数据存储.
pub trait VolumeStore {
    /// 数据集形状与块形状.
    fn info(&self, dataset: &str) -> Result<DatasetInfo, StoreError>;

    /// 数据集属性.
    fn attrs(&self, dataset: &str) -> Result<Attrs, StoreError>;

    /// 读取强度数据到 `dst`. 标签数据集按数值转换为 `f32`.
    fn read_data(
        &self,
        dataset: &str,
        region: &Region,
        dst: ArrayViewMut3<f32>,
    ) -> Result<(), StoreError>;

    /// 读取分割标签到 `dst`.
    fn read_labels(
        &self,
        dataset: &str,
        region: &Region,
        dst: ArrayViewMut3<u32>,
    ) -> Result<(), StoreError>;
}

impl<T: VolumeStore + ?Sized> VolumeStore for &T {
    #[inline]
    fn info(&self, dataset: &str) -> Result<DatasetInfo, StoreError> {
        (**self).info(dataset)
    }

    #[inline]
    fn attrs(&self, dataset: &str) -> Result<Attrs, StoreError> {
        (**self).attrs(dataset)
    }

    #[inline]
    fn read_data(
        &self,
        dataset: &str,
        region: &Region,
        dst: ArrayViewMut3<f32>,
    ) -> Result<(), StoreError> {
        (**self).read_data(dataset, region, dst)
    }

    #[inline]
    fn read_labels(
        &self,
        dataset: &str,
        region: &Region,
        dst: ArrayViewMut3<u32>,
    ) -> Result<(), StoreError> {
        (**self).read_labels(dataset, region, dst)
    }
}

/// 可写的体数据存储, 用于输出概率体.
pub trait VolumeSink {
    /// 数据集是否存在.
    fn contains(&self, dataset: &str) -> bool;

    /// 创建以 `fill` 填充的 `f32` 数据集. 同形状的数据集已存在时什么都不做.
    fn create(
        &mut self,
        dataset: &str,
        info: DatasetInfo,
        fill: f32,
    ) -> Result<(), StoreError>;

    /// 把 `src` 写入以 `begin` 为起点的区域.
    fn write_region(
        &mut self,
        dataset: &str,
        begin: [usize; 3],
        src: ArrayView3<f32>,
    ) -> Result<(), StoreError>;

    /// 设置数据集属性.
    fn set_attr(&mut self, dataset: &str, name: &str, value: AttrValue)
        -> Result<(), StoreError>;
}

/// 检查区域在形状范围内, 并返回无符号起点.
pub(crate) fn checked_region(
    dataset: &str,
    region: &Region,
    shape: [usize; 3],
    dst: &[usize],
) -> Result<[usize; 3], StoreError> {
    let in_bounds =
        (0..3).all(|d| region.begin[d] >= 0 && region.end[d] <= shape[d] as i64);
    if !in_bounds {
        return Err(StoreError::OutOfBounds {
            dataset: dataset.to_string(),
            begin: region.begin,
            end: region.end,
            shape,
        });
    }
    let size = region.size();
    if dst != size.as_slice() {
        return Err(StoreError::ShapeMismatch {
            dst: [dst[0], dst[1], dst[2]],
            region: size,
        });
    }
    Ok(region.begin.map(|b| b as usize))
}

/// 检查块形状能整除数据集形状.
pub(crate) fn checked_info(info: DatasetInfo) -> Result<DatasetInfo, StoreError> {
    let ok = (0..3).all(|d| info.chunks[d] > 0 && info.shape[d] % info.chunks[d] == 0);
    if ok {
        Ok(info)
    } else {
        Err(StoreError::BadChunks {
            shape: info.shape,
            chunks: info.chunks,
        })
    }
}
