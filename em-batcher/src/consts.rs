//! 通用常量.

/// 批次编号区间划分.
///
/// 外部训练循环依赖这一编号约定:
///
/// 1. `1 .. FIRST_RAND_NOLOOKUP_BATCH` 为基于标签查找表的随机批次;
/// 2. `FIRST_RAND_NOLOOKUP_BATCH .. FIRST_TILED_BATCH` 为不查表的均匀随机批次;
/// 3. `FIRST_TILED_BATCH ..` 为确定性平铺批次.
pub mod batch_range {
    /// 第一个不使用查找表的随机批次编号.
    pub const FIRST_RAND_NOLOOKUP_BATCH: u32 = 100_001;

    /// 第一个平铺批次编号.
    pub const FIRST_TILED_BATCH: u32 = 200_001;

    /// 批次编号所属的采样区间.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum Regime {
        /// 按标签先验平衡的随机采样.
        Balanced,

        /// 不查表的均匀随机采样.
        Uniform,

        /// 确定性平铺采样.
        Tiled,
    }

    impl Regime {
        /// 根据批次编号判断采样区间.
        #[inline]
        pub const fn of(batchnum: u32) -> Self {
            if batchnum >= FIRST_TILED_BATCH {
                Self::Tiled
            } else if batchnum >= FIRST_RAND_NOLOOKUP_BATCH {
                Self::Uniform
            } else {
                Self::Balanced
            }
        }
    }
}

/// 分割标签体素的特殊取值.
pub mod label {
    /// 未标注体素.
    pub const EMPTY_LABEL: u32 = u32::MAX;

    /// 细胞外空间 (ECS) 的固定标注值, 仅在 `EcsLabel::Sentinel` 模式下使用.
    pub const ECS_LABEL: u32 = u32::MAX - 1;

    /// 膜 (细胞外) 体素在分割标签中的取值.
    pub const MEMBRANE: u32 = 0;
}

/// 输出概率体中未被任何批次覆盖的体素的取值.
pub const EMPTY_PROB: f32 = -1.0;

/// 查找表与平铺索引以 `u16` 压缩存储, 因此坐标必须小于该值.
pub const CUBE_SUB_LIM: usize = 65_536;

/// 简单增强的总数 (含 z 方向翻转). 仅做 xy 增强时为 8.
pub const NAUGS: u8 = 16;

/// 少数标签阈值: 可选体素数占随机区体积的比例低于 1/32^3 时视为不可用.
pub const MINORITY_FRACTION: f64 = 1.0 / 32_768.0;

/// 输出文件及数据集名称.
pub mod names {
    /// 验证导出的文本报告.
    pub const INFO_FILE: &str = "batch.info";

    /// 验证导出的输入立方体归档.
    pub const OUTPUT_CUBES_IN: &str = "batch_input_data.npz";

    /// 重组概率体的归档.
    pub const OUTPUT_CUBES_OUT: &str = "batch_output_data.npz";

    /// 训练先验数据集名称.
    pub const PRIOR_DATASET: &str = "prior_train";

    /// 网络导出的单个批次输出文件名.
    #[inline]
    pub fn batch_file(batchnum: u32) -> String {
        format!("data_batch_{batchnum}.npy")
    }
}
