//! 运行时错误.
//!
//! 所有错误都是致命的: 它们意味着本次运行无法有意义地继续.
//! 可恢复的情况 (稀疏标签, 缺失的批次输出文件) 只记录日志, 不会出现在这里.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::Idx3d;
use thiserror::Error;

/// 批次生成与概率重组的错误.
#[derive(Error, Debug)]
pub enum EmError {
    /// 配置一致性错误.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// 体数据存储访问错误.
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    /// 标签在当前块中一个体素都没有, 但配置的先验非零.
    #[error("label {label} has no voxels in the loaded chunk but its configured prior is {prior}")]
    LabelMissing {
        /// 选择标签.
        label: usize,
        /// 配置的先验.
        prior: f64,
    },

    /// 去除边界后所有标签都没有可选体素.
    #[error("no voxels are eligible for random selection in the loaded chunk")]
    AllLabelsEmpty,

    /// 当前块完全未标注, 但启用了标签查找表.
    #[error("the loaded chunk contains only empty label voxels")]
    EmptyChunk,

    /// 坐标超出 `u16` 压缩存储范围.
    #[error("cube subscript {0:?} does not fit the compact index type")]
    SubscriptOverflow(Idx3d),

    /// 平铺批次编号解码出的 z 切片超出体范围.
    #[error("tiled batch {batchnum} decodes to z-slice {zslice}, beyond {ntotal} buffered slices")]
    TiledBatchOutOfRange {
        /// 批次编号.
        batchnum: u32,
        /// 解码出的 z 切片.
        zslice: usize,
        /// 已缓冲的 z 切片数.
        ntotal: usize,
    },

    /// 块编号超出块列表.
    #[error("chunk {chunk} is out of range of a chunk list with {len} entries")]
    ChunkOutOfRange {
        /// 块编号.
        chunk: usize,
        /// 列表长度.
        len: usize,
    },

    /// 随机块列表为空.
    #[error("no chunks are eligible for random batches")]
    NoRandChunks,

    /// 该采样区间在当前配置下不可用.
    #[error("batch regime unavailable: {0}")]
    RegimeUnavailable(&'static str),

    /// 网络输出的批次形状不符.
    #[error("batch {batchnum} output has shape {got:?}, expected {expected:?}")]
    BatchShape {
        /// 批次编号.
        batchnum: u32,
        /// 实际形状.
        got: (usize, usize),
        /// 期望形状.
        expected: (usize, usize),
    },

    /// 尚未调用 `init_batches`.
    #[error("batches have not been initialized")]
    NotInitialized,

    /// 底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 读取 npy 错误.
    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// 写入 npz 错误.
    #[error(transparent)]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    /// 序列化错误.
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

/// 本 crate 的 `Result`.
pub type EmResult<T> = Result<T, EmError>;
