//! 选择标签查找表.
//!
//! 每个选择标签对应一张可选体素坐标表, 随机批次先按先验抽标签, 再在表中均匀抽坐标.
//! 每次换块都重建.

use crate::consts::{CUBE_SUB_LIM, MINORITY_FRACTION};
use crate::error::{EmError, EmResult};
use crate::geometry::Geometry;
use crate::labels::UNSELECTABLE;
use crate::{Idx3d, Idx3dU16};
use log::{debug, warn};
use ndarray::{s, Array3};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// 每个轴上的可选掩码: 去除读块接缝两侧与外边界的 `read_border` 宽度.
fn axis_mask(size: usize, read_size: usize, border: usize) -> Vec<bool> {
    (0..size)
        .map(|c| {
            let inner = c % read_size;
            inner >= border && inner + border < read_size
        })
        .collect()
}

/// 随机区中可作为样本中心的体素.
///
/// z 方向先去掉 `nzslices / 2` 的边缘, 再按随机区内坐标去掉读块边界.
#[derive(Clone, Debug)]
struct Eligibility {
    masks: [Vec<bool>; 3],
    z_margin: usize,
    nrand: usize,
}

impl Eligibility {
    fn new(g: &Geometry) -> Self {
        let masks = [0, 1, 2].map(|d| axis_mask(g.size_rand[d], g.read_size[d], g.read_border[d]));
        Self {
            masks,
            z_margin: g.nzslices / 2,
            nrand: g.nrand_zslice,
        }
    }

    #[inline]
    fn contains(&self, (x, y, z): Idx3d) -> bool {
        z >= self.z_margin
            && z < self.nrand - self.z_margin
            && self.masks[0][x]
            && self.masks[1][y]
            && self.masks[2][z - self.z_margin]
    }
}

/// 标签查找表与先验.
///
/// # 注意
///
/// 1. 表中坐标已经加上 `labels_offset`, 可以直接索引数据立方体.
/// 2. 可选体素过少的标签会被当作不可用: 表被清空, 先验置零并均分给其余可用标签.
///   实际先验与采样先验因此保持一致.
#[derive(Clone, Debug)]
pub struct LabelLookup {
    tables: Vec<Vec<Idx3dU16>>,
    initial_priors: Vec<f64>,
    priors: Vec<f64>,
    rand_priors: Vec<f64>,
    dist: Option<WeightedIndex<f64>>,
}

impl LabelLookup {
    /// 以配置的先验创建空查找表. `None` 表示所有选择标签等概率.
    pub fn new(nlabels: usize, priors: Option<&[f64]>) -> Self {
        let initial_priors = match priors {
            Some(p) => p.to_vec(),
            None => vec![1.0 / nlabels as f64; nlabels],
        };
        Self {
            tables: vec![vec![]; nlabels],
            priors: initial_priors.clone(),
            initial_priors,
            rand_priors: vec![0.0; nlabels],
            dist: None,
        }
    }

    /// 选择标签个数.
    #[inline]
    pub fn nlabels(&self) -> usize {
        self.initial_priors.len()
    }

    /// 当前生效的采样先验.
    #[inline]
    pub fn priors(&self) -> &[f64] {
        &self.priors
    }

    /// 配置的先验.
    #[inline]
    pub fn initial_priors(&self) -> &[f64] {
        &self.initial_priors
    }

    /// 实际先验, 即各标签可选体素数的占比.
    #[inline]
    pub fn rand_priors(&self) -> &[f64] {
        &self.rand_priors
    }

    /// 标签 `label` 的查找表.
    #[inline]
    pub fn table(&self, label: usize) -> &[Idx3dU16] {
        &self.tables[label]
    }

    /// 各标签查找表长度.
    pub fn lens(&self) -> Vec<usize> {
        self.tables.iter().map(Vec::len).collect()
    }

    /// 是否已经构建.
    #[inline]
    pub fn is_built(&self) -> bool {
        self.dist.is_some()
    }

    /// 由选择标签立方体重建查找表.
    ///
    /// # 注意
    ///
    /// 1. 每次重建前先验恢复为配置值.
    /// 2. 某标签在随机区内一个体素都没有时, 其配置先验必须为零, 否则报错.
    pub fn build(&mut self, labels: &Array3<u8>, g: &Geometry) -> EmResult<()> {
        let n = self.nlabels();
        self.priors.copy_from_slice(&self.initial_priors);
        self.dist = None;
        for t in self.tables.iter_mut() {
            t.clear();
        }

        let elig = Eligibility::new(g);
        let off = g.labels_offset;
        let mut raw = vec![0usize; n];
        let mut unselectable = 0usize;
        let rand = labels.slice(s![.., .., ..g.nrand_zslice]);
        for ((x, y, z), &l) in rand.indexed_iter() {
            if l == UNSELECTABLE {
                unselectable += 1;
                continue;
            }
            let l = l as usize;
            raw[l] += 1;
            if !elig.contains((x, y, z)) {
                continue;
            }
            let p = (x + off[0], y + off[1], z + off[2]);
            self.tables[l].push(compact(p)?);
        }

        let nvox = rand.len();
        if unselectable == nvox {
            return Err(EmError::EmptyChunk);
        }
        if unselectable > 0 {
            warn!(
                "{unselectable} of {nvox} voxels in the rand region are unlabeled and never sampled"
            );
        }

        for (i, &r) in raw.iter().enumerate() {
            if r == 0 && self.priors[i] != 0.0 {
                return Err(EmError::LabelMissing {
                    label: i,
                    prior: self.priors[i],
                });
            }
        }

        let max_total = g.size_rand.iter().product::<usize>() as f64;
        let sparse: Vec<usize> = (0..n)
            .filter(|&i| (self.tables[i].len() as f64) / max_total < MINORITY_FRACTION)
            .collect();
        for &i in &sparse {
            if raw[i] > 0 {
                warn!(
                    "label {i} has only {} eligible voxels, forcing its prior to zero",
                    self.tables[i].len()
                );
            } else {
                debug!("label {i} has no voxels in the loaded chunk");
            }
            self.tables[i].clear();
        }
        self.redistribute(&sparse)?;

        let total: usize = self.tables.iter().map(Vec::len).sum();
        if total == 0 {
            return Err(EmError::AllLabelsEmpty);
        }
        self.rand_priors = self
            .tables
            .iter()
            .map(|t| t.len() as f64 / total as f64)
            .collect();
        self.dist = Some(WeightedIndex::new(&self.priors).map_err(|_| EmError::AllLabelsEmpty)?);
        Ok(())
    }

    /// 把 `sparse` 中各标签的先验均分给其余先验非零的标签.
    fn redistribute(&mut self, sparse: &[usize]) -> EmResult<()> {
        let moved: f64 = sparse.iter().map(|&i| self.priors[i]).sum();
        for &i in sparse {
            self.priors[i] = 0.0;
        }
        if moved == 0.0 {
            return Ok(());
        }
        let keep: Vec<usize> = (0..self.nlabels())
            .filter(|&i| self.priors[i] > 0.0)
            .collect();
        if keep.is_empty() {
            return Err(EmError::AllLabelsEmpty);
        }
        let share = moved / keep.len() as f64;
        for i in keep {
            self.priors[i] += share;
        }
        Ok(())
    }

    /// 按采样先验抽取一个标签.
    pub fn sample_label<R: Rng + ?Sized>(&self, rng: &mut R) -> EmResult<usize> {
        let dist = self.dist.as_ref().ok_or(EmError::NotInitialized)?;
        Ok(dist.sample(rng))
    }

    /// 在标签 `label` 的表中均匀抽取一个坐标. 采样先验为零的标签不会被抽到,
    /// 其表可能为空, 此时返回 `None`.
    pub fn sample_index<R: Rng + ?Sized>(&self, rng: &mut R, label: usize) -> Option<Idx3d> {
        let t = &self.tables[label];
        if t.is_empty() {
            return None;
        }
        let (x, y, z) = t[rng.gen_range(0..t.len())];
        Some((x as usize, y as usize, z as usize))
    }
}

/// 把坐标压缩为 `u16`.
pub(crate) fn compact(p: Idx3d) -> EmResult<Idx3dU16> {
    if p.0 >= CUBE_SUB_LIM || p.1 >= CUBE_SUB_LIM || p.2 >= CUBE_SUB_LIM {
        return Err(EmError::SubscriptOverflow(p));
    }
    Ok((p.0 as u16, p.1 as u16, p.2 as u16))
}

/// 平铺区的选择标签统计.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TiledCensus {
    /// 各标签体素数.
    pub counts: Vec<usize>,

    /// 计入的体素总数.
    pub total: usize,
}

impl TiledCensus {
    /// 各标签占比. 平铺区没有任何可统计体素时为 `None`.
    pub fn priors(&self) -> Option<Vec<f64>> {
        (self.total > 0).then(|| {
            self.counts
                .iter()
                .map(|&c| c as f64 / self.total as f64)
                .collect()
        })
    }
}

/// 统计平铺区 (去掉 `nzslices / 2` 边缘) 的选择标签分布, 用于测试先验.
pub fn enumerate_tiled(labels: &Array3<u8>, g: &Geometry, nlabels: usize) -> TiledCensus {
    let mut census = TiledCensus {
        counts: vec![0; nlabels],
        total: 0,
    };
    let m = g.nzslices / 2;
    if g.ntiled_zslice <= 2 * m {
        return census;
    }
    let tiled = labels.slice(s![.., .., g.nrand_zslice + m..g.ntotal_zslice - m]);
    for &l in tiled.iter().filter(|&&l| l != UNSELECTABLE) {
        census.counts[l as usize] += 1;
        census.total += 1;
    }
    census
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParserConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn geom(read_size: [usize; 3], read_border: [usize; 3], nzslices: usize) -> Geometry {
        let cfg = ParserConfig {
            image_size: 5,
            tile_size: [4, 4, 1],
            size_rand: [16, 16, 4],
            nz_tiled: 4,
            nzslices,
            read_size: Some(read_size),
            read_border,
            no_label_lookup: false,
            ..Default::default()
        };
        Geometry::new(&cfg, 0).unwrap()
    }

    #[test]
    fn test_axis_mask() {
        let m = axis_mask(8, 4, 1);
        assert_eq!(
            m,
            vec![false, true, true, false, false, true, true, false]
        );
        assert!(axis_mask(5, 5, 0).into_iter().all(|v| v));
    }

    /// 一半体素为 0, 一半为 1.
    fn halves(g: &Geometry) -> Array3<u8> {
        Array3::from_shape_fn(g.labels_slice_size, |(x, _, _)| (x >= 8) as u8)
    }

    #[test]
    fn test_build_offsets_and_border() {
        let g = geom([8, 16, 4], [1, 0, 0], 3);
        let mut lk = LabelLookup::new(2, None);
        lk.build(&halves(&g), &g).unwrap();
        // x 去掉 {0, 7, 8, 15}, z 去掉两端边缘.
        assert_eq!(lk.lens(), vec![6 * 16 * 4, 6 * 16 * 4]);
        let h = g.image_size / 2;
        for &(x, y, z) in lk.table(1) {
            let (x, y, z) = (x as usize - h, y as usize - h, z as usize);
            assert!((9..15).contains(&x));
            assert!(y < 16);
            assert!((1..5).contains(&z));
        }
        assert!((lk.rand_priors()[0] - 0.5).abs() < 1e-12);
        assert!(lk.is_built());
    }

    #[test]
    fn test_missing_label_with_prior_is_fatal() {
        let g = geom([16, 16, 4], [0, 0, 0], 1);
        let zeros = Array3::<u8>::zeros(g.labels_slice_size);
        let mut lk = LabelLookup::new(2, Some(&[0.5, 0.5]));
        assert!(matches!(
            lk.build(&zeros, &g),
            Err(EmError::LabelMissing { label: 1, .. })
        ));

        let mut lk = LabelLookup::new(2, Some(&[1.0, 0.0]));
        lk.build(&zeros, &g).unwrap();
        assert_eq!(lk.priors(), &[1.0, 0.0]);
    }

    /// 稀疏标签的先验被置零并重新分配, 总和仍为 1.
    #[test]
    fn test_sparse_label_redistribution() {
        let g = geom([16, 16, 4], [0, 0, 0], 1);
        let mut labels = Array3::<u8>::zeros(g.labels_slice_size);
        labels[(5, 5, 0)] = 1;
        // 标签 2 只出现在平铺区, 不计入随机区.
        labels[(0, 0, g.nrand_zslice)] = 2;
        let mut lk = LabelLookup::new(3, Some(&[0.4, 0.4, 0.2]));
        assert!(matches!(
            lk.build(&labels, &g),
            Err(EmError::LabelMissing { label: 2, .. })
        ));

        let g = geom([8, 16, 4], [1, 0, 0], 1);
        let mut labels = Array3::<u8>::zeros(g.labels_slice_size);
        // 只落在接缝上, 去除边界后为空.
        labels.slice_mut(s![7..9, .., ..]).fill(1);
        let mut lk = LabelLookup::new(2, Some(&[0.3, 0.7]));
        lk.build(&labels, &g).unwrap();
        assert_eq!(lk.lens()[1], 0);
        assert!((lk.priors()[0] - 1.0).abs() < 1e-12);
        assert_eq!(lk.priors()[1], 0.0);
        assert_eq!(lk.rand_priors(), &[1.0, 0.0]);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert_eq!(lk.sample_label(&mut rng).unwrap(), 0);
        }
        assert!(lk.sample_index(&mut rng, 1).is_none());
    }

    /// 重建前恢复配置先验.
    #[test]
    fn test_rebuild_restores_priors() {
        let g = geom([8, 16, 4], [1, 0, 0], 1);
        let mut seam = Array3::<u8>::zeros(g.labels_slice_size);
        seam.slice_mut(s![7..9, .., ..]).fill(1);
        let mut lk = LabelLookup::new(2, Some(&[0.3, 0.7]));
        lk.build(&seam, &g).unwrap();
        assert_eq!(lk.priors()[1], 0.0);
        lk.build(&halves(&g), &g).unwrap();
        assert_eq!(lk.priors(), &[0.3, 0.7]);
    }

    #[test]
    fn test_unlabeled_chunk() {
        let g = geom([16, 16, 4], [0, 0, 0], 1);
        let empty = Array3::from_elem(g.labels_slice_size, UNSELECTABLE);
        let mut lk = LabelLookup::new(2, None);
        assert!(matches!(lk.build(&empty, &g), Err(EmError::EmptyChunk)));
        assert!(matches!(
            lk.sample_label(&mut StdRng::seed_from_u64(0)),
            Err(EmError::NotInitialized)
        ));
    }

    #[test]
    fn test_enumerate_tiled() {
        let g = geom([16, 16, 4], [0, 0, 0], 3);
        let mut labels = Array3::<u8>::zeros(g.labels_slice_size);
        labels
            .slice_mut(s![..4, .., g.nrand_zslice..])
            .fill(1);
        let c = enumerate_tiled(&labels, &g, 2);
        assert_eq!(c.total, 16 * 16 * 4);
        assert_eq!(c.counts, vec![12 * 16 * 4, 4 * 16 * 4]);
        let p = c.priors().unwrap();
        assert!((p[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_compact_overflow() {
        assert!(compact((1, 2, 3)).is_ok());
        assert!(matches!(
            compact((CUBE_SUB_LIM, 0, 0)),
            Err(EmError::SubscriptOverflow(_))
        ));
    }
}
