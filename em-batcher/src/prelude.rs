//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Idx3dU16};

pub use crate::config::{ConfigError, ParserConfig};
pub use crate::error::{EmError, EmResult};

pub use crate::batch::{Batch, BatchGenerator, BatchMeta, BatchOptions, PriorCounts, Sources};
pub use crate::consts::batch_range::{Regime, FIRST_RAND_NOLOOKUP_BATCH, FIRST_TILED_BATCH};
pub use crate::consts::EMPTY_PROB;

pub use crate::geometry::{DimOrdering, Geometry};
pub use crate::labels::{EcsLabel, IndepScheme, SelectScheme};

pub use crate::store::{MemStore, VolumeSink, VolumeStore};

#[cfg(feature = "serde")]
pub use crate::store::NpyDirStore;

pub use crate::reassemble::{
    BatchOutputSource, MemBatchOutputs, NpyBatchDir, OutputTarget, Reassembler, Reweight,
};

pub use crate::export::export_validation;
