#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 从分块存储的 3D 电镜 (EM) 体数据与体素级分割标签中按需生成训练 / 测试批次,
//! 并把网络输出的逐批次概率重组回概率体.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 一个批次生成器在同一时刻只缓冲一个块 (随机区加可选的平铺区).
//!   块列表模式下, 取批次时可能同步换块.
//! 2. 批次编号决定采样方式, 见 [`consts::batch_range`].
//! 3. 存储访问只经过 [`store::VolumeStore`] 与 [`store::VolumeSink`] 两个接口,
//!   不依赖任何具体的文件格式.
//!
//! # 组成
//!
//! ### 寻址与重切片 ✅
//!
//! 块坐标到体素坐标的换算, 原始轴序到规范轴序的置换.
//!
//! 实现位于 `em-batcher/src/geometry`.
//!
//! ### 立方体缓冲 ✅
//!
//! 原始数据, 辅助数据与分割标签立方体只分配一次, 换块时原地重新填充.
//!
//! 实现位于 `em-batcher/src/cube.rs`.
//!
//! ### 标签方案与查找表 ✅
//!
//! 分割标签到选择标签的映射, 独立标签目标, 按先验平衡抽样的查找表.
//!
//! 实现位于 `em-batcher/src/labels.rs` 与 `em-batcher/src/lookup.rs`.
//!
//! ### 平铺索引与块流 ✅
//!
//! 确定性平铺样本的正向 / 逆向索引, 块列表与块区间的换块状态机.
//!
//! 实现位于 `em-batcher/src/tiled.rs` 与 `em-batcher/src/chunk.rs`.
//!
//! ### 批次生成 ✅
//!
//! 实现位于 `em-batcher/src/batch`.
//!
//! ### 概率体重组与先验重加权 ✅
//!
//! 实现位于 `em-batcher/src/reassemble.rs`.
//!
//! ### 验证导出 ✅
//!
//! 实现位于 `em-batcher/src/export.rs`.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 压缩存储优化时会用到. 坐标必须小于 [`consts::CUBE_SUB_LIM`].
pub type Idx3dU16 = (u16, u16, u16);

/// 里程碑日志. 静默时降为 `debug` 级别.
macro_rules! milestone {
    ($silent:expr, $($arg:tt)+) => {
        if $silent {
            ::log::debug!($($arg)+)
        } else {
            ::log::info!($($arg)+)
        }
    };
}

pub mod consts;

mod error;

pub use error::{EmError, EmResult};

pub mod config;

pub use config::{ConfigError, ParserConfig};

pub mod geometry;

pub mod store;

pub mod cube;

pub mod labels;

pub mod lookup;

pub mod tiled;

pub mod chunk;

pub mod augment;

pub mod batch;

pub use batch::{Batch, BatchGenerator, BatchMeta, BatchOptions, PriorCounts, Sources};

pub mod reassemble;

pub mod export;

pub mod prelude;
