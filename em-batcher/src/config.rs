//! 运行配置.
//!
//! `ParserConfig` 是一个显式枚举全部字段的不可变记录. 配置文件的解析不在本 crate 中,
//! 启用 `serde` feature 后外部配置层可以直接反序列化它.
//!
//! 各组件只拿到自己需要的子记录 (`Geometry`, `LabelSetup`, `ChunkConfig`),
//! 一致性检查在构造这些子记录时一次性完成.

use crate::geometry::DimOrdering;
use crate::labels::{EcsLabel, IndepScheme, SelectScheme};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 配置一致性错误.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `nzslices` 只能为 1 或 3.
    #[error("nzslices must be 1 or 3, got {0}")]
    InvalidZSlices(usize),

    /// 输入与输出补丁边长的奇偶性不同.
    #[error("image_size {image_size} and image_out_size {image_out_size} differ in parity")]
    ParityMismatch {
        /// 输入边长.
        image_size: usize,
        /// 输出边长.
        image_out_size: usize,
    },

    /// 多像素输出需要独立标签.
    #[error("image_out_size {0} > 1 requires independent labels")]
    MultiPixelNeedsIndependent(usize),

    /// 无标签模式必须同时关闭标签查找表.
    #[error("no_labels requires no_label_lookup")]
    NoLabelsNeedsNoLookup,

    /// 某个尺寸不能被另一个尺寸整除.
    #[error("{what}: {size:?} is not divisible by {by:?}")]
    NotDivisible {
        /// 所检查的量.
        what: &'static str,
        /// 被除数.
        size: [usize; 3],
        /// 除数.
        by: [usize; 3],
    },

    /// 平铺布局既有多个批次每 z 切片又有多个 z 切片每批次.
    #[error("tile layout has {batches_per_zslice} batches per z-slice and {zslices_per_batch} z-slices per batch")]
    TileLayout {
        /// 每个 z 切片的批次数.
        batches_per_zslice: usize,
        /// 每个批次的 z 切片数.
        zslices_per_batch: usize,
    },

    /// 尺寸为零.
    #[error("{0} must be nonzero in every dimension")]
    ZeroSize(&'static str),

    /// 未知的枚举名称.
    #[error("unknown {what} '{name}'")]
    UnknownName {
        /// 枚举类别.
        what: &'static str,
        /// 给定名称.
        name: String,
    },

    /// 该独立标签方案只能在独立标签模式下使用.
    #[error("label scheme {0} requires independent labels")]
    SchemeNeedsIndependent(&'static str),

    /// 带边界的标签只能在独立标签模式下使用.
    #[error("a segmented label border requires independent labels")]
    BorderNeedsIndependent,

    /// 先验向量长度不符.
    #[error("{what} has {got} entries, expected {expected}")]
    PriorLength {
        /// 所检查的量.
        what: &'static str,
        /// 实际长度.
        got: usize,
        /// 期望长度.
        expected: usize,
    },

    /// 先验取值不合法.
    #[error("{what} is not a valid prior vector: {values:?}")]
    InvalidPrior {
        /// 所检查的量.
        what: &'static str,
        /// 给定取值.
        values: Vec<f64>,
    },

    /// 辅助数据集的均值或标准差个数不足.
    #[error("{got} aug mean/std values configured for {expected} aug datasets")]
    AugStatsLength {
        /// 实际长度.
        got: usize,
        /// 期望长度.
        expected: usize,
    },

    /// 块列表模式下不能再定义平铺区.
    #[error("nz_tiled must be zero in chunk list mode")]
    TiledInChunkList,

    /// 块列表定义错误.
    #[error("bad chunk list: {0}")]
    ChunkList(String),

    /// 块区间模式下平铺批次要求随机区恰好为一个存储块.
    #[error("tiled batches in chunk range mode need size_rand {size_rand:?} equal to the chunk shape {chunks:?}")]
    RangeNeedsChunkSizedRand {
        /// 随机区大小 (原始轴序).
        size_rand: [usize; 3],
        /// 存储块形状 (原始轴序).
        chunks: [usize; 3],
    },

    /// 增强掩码超出 4 位.
    #[error("augs_mask {0} has bits beyond the 16 augmentation codes")]
    AugsMask(u8),

    /// 追加写出概率体时不能有平铺区.
    #[error("appending outputs to a dataset-spanning store needs nz_tiled = 0")]
    AppendWithTiled,
}

/// 完整的运行配置.
///
/// 字段取值均为原始 (未重切片) 轴序. `Geometry::new` 会一次性把需要重切片的量转换为规范轴序.
///
/// # 注意
///
/// 1. 负值的 `em_mean` 和非正的 `em_std` 表示使用当前块的实测统计量.
/// 2. `nz_tiled` 为负表示与随机区的 z 大小相同.
/// 3. `label_priors` 为 `None` 表示所有选择标签等概率.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Clone, Debug, PartialEq)]
pub struct ParserConfig {
    /// 原始数据集名称.
    pub data_dataset: String,

    /// 分割标签数据集名称.
    pub label_dataset: String,

    /// 与原始数据同几何的辅助数据集名称.
    pub aug_datasets: Vec<String>,

    /// 存储是否行优先. 列优先存储的形状与块形状都是原始轴序的逆序.
    pub storage_c_order: bool,

    /// 块坐标是否以体中心为原点 (此时可以为负).
    pub origin_chunk_inds: bool,

    /// 随机区所在块.
    pub chunk_rand: [i64; 3],

    /// 随机区在块内的体素偏移.
    pub offset_rand: [usize; 3],

    /// 平铺区所在块.
    pub chunk_tiled: [i64; 3],

    /// 平铺区在块内的体素偏移.
    pub offset_tiled: [usize; 3],

    /// 块列表, 或块区间模式下每个区间的起点 (含).
    pub chunk_range_beg: Vec<[i64; 3]>,

    /// 块区间模式下每个区间的终点 (不含). 为空表示普通块列表模式.
    pub chunk_range_end: Vec<[i64; 3]>,

    /// 每个列表项 (或区间) 的偏移. 为空表示全零.
    pub offset_list: Vec<[usize; 3]>,

    /// 可用于随机批次的块数 (前缀). `None` 表示全部.
    pub chunk_range_rand: Option<usize>,

    /// 不参与随机批次的块.
    pub chunk_skip_list: Vec<usize>,

    /// 为真时平铺批次只使用被跳过的块 (测试块), 否则使用全部块.
    pub chunk_skip_is_test: bool,

    /// 随机批次是随机挑选块 (真) 还是轮询 (假).
    pub chunk_list_rand: bool,

    /// 输入补丁边长.
    pub image_size: usize,

    /// 输出补丁边长.
    pub image_out_size: usize,

    /// 每个样本的 z 切片数, 1 或 3.
    pub nzslices: usize,

    /// 平铺批次的形状 (以输出补丁计). 不参与重切片.
    pub tile_size: [usize; 3],

    /// 随机区大小.
    pub size_rand: [usize; 3],

    /// 平铺区的 z 切片数.
    pub nz_tiled: i64,

    /// 独立标注的子块大小. `None` 表示与随机区相同.
    pub read_size: Option<[usize; 3]>,

    /// 子块接缝处不参与随机采样的边界宽度.
    pub read_border: [usize; 3],

    /// 查表采样时输出补丁中心的随机平移窗口边长.
    pub image_out_offset: usize,

    /// 重切片轴序.
    pub dim_ordering: DimOrdering,

    /// 选择标签方案.
    pub select_label_type: SelectScheme,

    /// 独立标签方案, 仅在 `independent_labels` 为真时使用.
    pub label_type: IndepScheme,

    /// ECS 标签的取值方式.
    pub ecs_label: EcsLabel,

    /// 选择标签的训练先验.
    pub label_priors: Option<Vec<f64>>,

    /// 测试先验, 用于概率重加权. 为空表示不重加权.
    pub prior_test: Vec<f64>,

    /// 独立标签时对每个类别单独做二元重加权.
    pub prior_test_indep: bool,

    /// 是否输出独立标签.
    pub independent_labels: bool,

    /// 不读取标签.
    pub no_labels: bool,

    /// 输出全零标签.
    pub zero_labels: bool,

    /// 不构建标签查找表.
    pub no_label_lookup: bool,

    /// 原始数据均值.
    pub em_mean: f64,

    /// 原始数据标准差.
    pub em_std: f64,

    /// 每个辅助数据集的均值.
    pub aug_mean: Vec<f64>,

    /// 每个辅助数据集的标准差.
    pub aug_std: Vec<f64>,

    /// 随机批次可用的增强码掩码.
    pub augs_mask: u8,

    /// 随机数种子. `None` 表示从操作系统取种子.
    pub rng_seed: Option<u64>,

    /// 输出更多的几何信息日志.
    pub verbose: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            data_dataset: "data_mag1".to_string(),
            label_dataset: "labels".to_string(),
            aug_datasets: vec![],
            storage_c_order: true,
            origin_chunk_inds: false,
            chunk_rand: [0, 0, 0],
            offset_rand: [0, 0, 0],
            chunk_tiled: [0, 0, 0],
            offset_tiled: [0, 0, 0],
            chunk_range_beg: vec![],
            chunk_range_end: vec![],
            offset_list: vec![],
            chunk_range_rand: None,
            chunk_skip_list: vec![],
            chunk_skip_is_test: false,
            chunk_list_rand: false,
            image_size: 65,
            image_out_size: 1,
            nzslices: 1,
            tile_size: [32, 32, 1],
            size_rand: [128, 128, 128],
            nz_tiled: 0,
            read_size: None,
            read_border: [0, 0, 0],
            image_out_offset: 0,
            dim_ordering: DimOrdering::Xyz,
            select_label_type: SelectScheme::IcsOut,
            label_type: IndepScheme::IcsOrOut,
            ecs_label: EcsLabel::Sentinel,
            label_priors: None,
            prior_test: vec![],
            prior_test_indep: false,
            independent_labels: false,
            no_labels: false,
            zero_labels: false,
            no_label_lookup: false,
            em_mean: -1.0,
            em_std: -1.0,
            aug_mean: vec![],
            aug_std: vec![],
            augs_mask: 0x0f,
            rng_seed: None,
            verbose: false,
        }
    }
}

impl ParserConfig {
    /// 是否处于块列表 (或块区间) 模式.
    #[inline]
    pub fn uses_chunk_list(&self) -> bool {
        !self.chunk_range_beg.is_empty()
    }

    /// 检查与几何无关的配置一致性. 几何部分由 `Geometry::new` 检查.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.no_labels && !self.no_label_lookup {
            return Err(ConfigError::NoLabelsNeedsNoLookup);
        }
        if self.augs_mask & !0x0f != 0 {
            return Err(ConfigError::AugsMask(self.augs_mask));
        }
        let naug = self.aug_datasets.len();
        let got = self.aug_mean.len().min(self.aug_std.len());
        if got < naug {
            return Err(ConfigError::AugStatsLength {
                got,
                expected: naug,
            });
        }
        if self.uses_chunk_list() && self.nz_tiled != 0 {
            return Err(ConfigError::TiledInChunkList);
        }
        if let Some(p) = &self.label_priors {
            if p.iter().any(|&v| !(0.0..=1.0).contains(&v)) || (p.iter().sum::<f64>() - 1.0).abs() > 1e-6
            {
                return Err(ConfigError::InvalidPrior {
                    what: "label_priors",
                    values: p.clone(),
                });
            }
        }
        Ok(())
    }
}
