//! 训练先验统计.

use ndarray::Array2;

#[cfg(feature = "serde")]
use {
    crate::error::EmResult,
    flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression},
    serde::{Deserialize, Serialize},
    std::{
        fs::File,
        io::{Read, Write},
        path::Path,
    },
};

/// 训练批次中各标签出现次数的累计.
///
/// 互斥标签按网络目标值计数, 独立标签按每一行的非零目标计数. 两种情况下 `total` 都是样本数.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PriorCounts {
    /// 累计样本数.
    pub total: u64,
    /// 每个标签 (或每个独立输出) 的计数.
    pub counts: Vec<u64>,
}

impl PriorCounts {
    /// `n` 个标签的零计数.
    pub fn new(n: usize) -> Self {
        Self {
            total: 0,
            counts: vec![0; n],
        }
    }

    /// 累计一个批次的网络目标, `labels` 的形状为 `[输出数, 样本数]`.
    ///
    /// # 注意
    ///
    /// 超出标签范围的目标值 (如未标注体素) 不计入任何标签, 但计入 `total`.
    pub fn tally(&mut self, labels: &Array2<f32>, independent: bool) {
        self.total += labels.ncols() as u64;
        if independent {
            for (c, row) in self.counts.iter_mut().zip(labels.rows()) {
                *c += row.iter().filter(|&&v| v != 0.0).count() as u64;
            }
            return;
        }
        let n = self.counts.len();
        for &v in labels.row(0) {
            let l = v as usize;
            if v >= 0.0 && l < n {
                self.counts[l] += 1;
            }
        }
    }

    /// 归一化后的训练先验. 尚无样本时为 `None`.
    pub fn train_priors(&self) -> Option<Vec<f64>> {
        if self.total == 0 {
            return None;
        }
        let t = self.total as f64;
        Some(self.counts.iter().map(|&c| c as f64 / t).collect())
    }
}

#[cfg(feature = "serde")]
impl PriorCounts {
    /// 保存为 zlib 压缩的 bincode 文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> EmResult<()> {
        let buf = bincode::serialize(self)?;
        let mut e = ZlibEncoder::new(File::create(path)?, Compression::best());
        e.write_all(&buf)?;
        e.finish()?;
        Ok(())
    }

    /// 读取 [`PriorCounts::save`] 保存的文件.
    pub fn load<P: AsRef<Path>>(path: P) -> EmResult<Self> {
        let mut d = ZlibDecoder::new(File::open(path)?);
        let mut buf = Vec::new();
        d.read_to_end(&mut buf)?;
        Ok(bincode::deserialize(&buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_tally_exclusive() {
        let mut p = PriorCounts::new(2);
        assert!(p.train_priors().is_none());
        p.tally(&arr2(&[[0.0, 1.0, 1.0, 255.0]]), false);
        assert_eq!(p.total, 4);
        assert_eq!(p.counts, vec![1, 2]);
        assert_eq!(p.train_priors().unwrap(), vec![0.25, 0.5]);
    }

    #[test]
    fn test_tally_independent() {
        let mut p = PriorCounts::new(2);
        p.tally(&arr2(&[[1.0, 0.0, 1.0], [1.0, 1.0, 1.0]]), true);
        assert_eq!(p.total, 3);
        assert_eq!(p.counts, vec![2, 3]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priors.bin");
        let p = PriorCounts {
            total: 10,
            counts: vec![3, 7],
        };
        p.save(&path).unwrap();
        assert_eq!(PriorCounts::load(&path).unwrap(), p);
    }
}
