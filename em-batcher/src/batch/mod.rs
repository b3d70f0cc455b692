//! 训练批次生成.
//!
//! [`BatchGenerator`] 持有当前块的全部立方体, 按批次编号所属区间
//! (见 [`crate::consts::batch_range`]) 产生样本坐标, 再并行提取补丁.
//!
//! # 使用
//!
//! ```ignore
//! let mut g = BatchGenerator::new(cfg, Sources::shared(&store))?;
//! g.init_batches()?;
//! let batch = g.get_batch(1, &BatchOptions::default(), None)?;
//! ```

mod extract;
mod prior;

#[cfg(test)]
mod tests;

pub use prior::PriorCounts;

use crate::augment::random_code;
use crate::chunk::{ChunkConfig, ChunkList, ChunkStream, StreamState};
use crate::config::{ConfigError, ParserConfig};
use crate::consts::batch_range::{Regime, FIRST_TILED_BATCH};
use crate::cube::{ChunkPos, CubeSlot, CubeStore, StorageLayout};
use crate::error::{EmError, EmResult};
use crate::geometry::Geometry;
use crate::labels::LabelSetup;
use crate::lookup::LabelLookup;
use crate::store::{Attrs, DatasetInfo, VolumeStore};
use crate::tiled::TiledIndex;
use extract::{fill_images, fill_labels, Case, LabelSource};
use log::debug;
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 原始数据与分割标签的存储.
#[derive(Clone, Debug)]
pub struct Sources<S> {
    /// 原始数据 (以及辅助数据) 所在的存储.
    pub data: S,
    /// 分割标签所在的存储.
    pub labels: S,
}

impl<S: Clone> Sources<S> {
    /// 数据与标签位于同一存储.
    pub fn shared(store: S) -> Self {
        Self {
            data: store.clone(),
            labels: store,
        }
    }
}

/// 单次取批次的选项.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchOptions {
    /// 用于显示: 不做归一化.
    pub for_display: bool,
    /// 平铺批次的固定增强码.
    pub tiled_aug: u8,
}

/// 一个批次. 所有缓冲区的每一列为一个样本.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// 输入补丁, `[pixels_per_image, num_cases_per_batch]`.
    pub data: Array2<f32>,
    /// 辅助数据补丁, 每个辅助数据集一个, 形状同 `data`.
    pub aug_data: Vec<Array2<f32>>,
    /// 网络目标, `[noutputs, num_cases_per_batch]`. 无标签时为 0 行.
    pub labels: Array2<f32>,
    /// 分割上下文, `[pixels_per_seg_out, num_cases_per_batch]`. 无标签时为 0 行.
    pub seg_labels: Array2<u32>,
}

/// 网络一侧需要的批次描述.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMeta {
    /// 每批次的样本数.
    pub num_cases_per_batch: usize,
    /// 输出名称. 无标签时为空.
    pub label_names: Vec<String>,
    /// 选择标签个数.
    pub nlabels: usize,
    /// 每个样本的输入像素数.
    pub pixels_per_image: usize,
    /// 每个样本的网络输出数. 无标签时为 0.
    pub noutputs: usize,
}

/// 一个立方体的强度统计.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct Stats {
    mean: f64,
    std: f64,
}

/// 训练批次生成器.
///
/// # 注意
///
/// 1. 必须先调用 [`BatchGenerator::init_batches`].
/// 2. 块列表模式下, 取批次可能触发换块, 所有立方体与查找表随之原地重建.
#[derive(Debug)]
pub struct BatchGenerator<S> {
    cfg: ParserConfig,
    geom: Geometry,
    setup: LabelSetup,
    sources: Sources<S>,
    cubes: CubeStore,
    select: CubeSlot<u8>,
    lookup: Option<LabelLookup>,
    tiled: Option<TiledIndex>,
    chunks: Option<ChunkStream>,
    stats: Stats,
    aug_stats: Vec<Stats>,
    ecs: u32,
    data_attrs: Attrs,
    data_info: Option<DatasetInfo>,
    rng: StdRng,
    meta: Option<BatchMeta>,
}

/// 配置值 (非负均值, 正标准差) 优先, 否则使用实测统计.
#[inline]
fn effective(mean: f64, std: f64, measured: Stats) -> Stats {
    Stats {
        mean: if mean >= 0.0 { mean } else { measured.mean },
        std: if std > 0.0 { std } else { measured.std },
    }
}

fn standardize(a: &mut Array2<f32>, s: Stats) {
    if s.std > 0.0 {
        a.mapv_inplace(|v| ((v as f64 - s.mean) / s.std) as f32);
    } else {
        a.mapv_inplace(|v| (v as f64 - s.mean) as f32);
    }
}

impl<S: VolumeStore> BatchGenerator<S> {
    /// 检查配置并创建生成器, 不读取任何数据.
    pub fn new(cfg: ParserConfig, sources: Sources<S>) -> EmResult<Self> {
        cfg.validate()?;
        let setup = LabelSetup::new(&cfg)?;
        let geom = Geometry::new(&cfg, setup.border())?;
        let chunks = ChunkConfig::from_config(&cfg)?.map(ChunkStream::new);
        let layout = StorageLayout {
            c_order: cfg.storage_c_order,
            origin_centered: cfg.origin_chunk_inds,
        };
        let naug = cfg.aug_datasets.len();
        let cubes = CubeStore::new(geom.clone(), layout, naug);
        let lookup =
            (!cfg.no_label_lookup).then(|| LabelLookup::new(setup.nlabels(), cfg.label_priors.as_deref()));
        let rng = match cfg.rng_seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        if cfg.verbose {
            debug!("{geom:?}");
        }
        Ok(Self {
            geom,
            setup,
            sources,
            cubes,
            select: CubeSlot::Empty,
            lookup,
            tiled: None,
            chunks,
            stats: Stats::default(),
            aug_stats: vec![Stats::default(); naug],
            ecs: crate::consts::label::ECS_LABEL,
            data_attrs: Attrs::new(),
            data_info: None,
            rng,
            meta: None,
            cfg,
        })
    }

    /// 缓冲初始块, 建立查找表与平铺索引.
    pub fn init_batches(&mut self) -> EmResult<()> {
        let t = Instant::now();
        self.reload(false)?;
        milestone!(false, "batches initialized ({:.3} s)", t.elapsed().as_secs_f64());
        Ok(())
    }

    /// 初始位置: 单块模式下为配置的随机区与平铺区, 块列表模式下为当前块.
    fn positions(&mut self) -> EmResult<(ChunkPos, Option<ChunkPos>)> {
        if let Some(s) = &mut self.chunks {
            let cur = match s.state().current() {
                Some(c) => c,
                None => s.start()?,
            };
            return Ok((cur, None));
        }
        let rand = ChunkPos::new(self.cfg.chunk_rand, self.cfg.offset_rand);
        let tiled = self
            .geom
            .has_tiled()
            .then(|| ChunkPos::new(self.cfg.chunk_tiled, self.cfg.offset_tiled));
        Ok((rand, tiled))
    }

    /// 重新缓冲当前位置的全部立方体.
    fn reload(&mut self, silent: bool) -> EmResult<()> {
        let (rand, tiled) = self.positions()?;
        milestone!(
            silent,
            "buffering chunk {:?} offset {:?}{}",
            rand.chunk,
            rand.offset,
            tiled.map_or(String::new(), |t| format!(", tiled chunk {:?} offset {:?}", t.chunk, t.offset))
        );

        let load = self
            .cubes
            .load_data(&self.sources.data, &self.cfg.data_dataset, rand, tiled)?;
        milestone!(silent, "data mean {:.4} std {:.4}", load.mean, load.std);
        self.cubes.load_labels(
            &self.sources.labels,
            &self.cfg.label_dataset,
            rand,
            tiled,
            self.cfg.no_labels,
            load.chunk_shape,
        )?;
        for (i, name) in self.cfg.aug_datasets.iter().enumerate() {
            let a = self.cubes.load_aug(i, &self.sources.data, name, rand, tiled)?;
            self.aug_stats[i] = Stats {
                mean: a.mean,
                std: a.std,
            };
            milestone!(silent, "buffered aug data '{name}' mean {:.4} std {:.4}", a.mean, a.std);
        }
        self.stats = Stats {
            mean: load.mean,
            std: load.std,
        };
        self.data_info = Some(DatasetInfo {
            shape: load.shape,
            chunks: load.chunk_shape,
        });
        self.data_attrs = load.attrs;

        if let Some(seg) = self.cubes.seg() {
            self.ecs = self.setup.ecs().resolve(seg.view());
            let sel = self.select.get_or_alloc(self.geom.labels_slice_size);
            self.setup.select_labels(seg, self.ecs, sel);
        }
        if let (Some(lk), Some(sel)) = (&mut self.lookup, self.select.get()) {
            milestone!(silent, "creating rand label lookup");
            lk.build(sel, &self.geom)?;
            milestone!(silent, "label lookup sizes {:?}, rand priors {:?}", lk.lens(), lk.rand_priors());
        }
        if self.tiled.is_none() {
            self.tiled = Some(TiledIndex::new(&self.geom)?);
        }
        self.meta = Some(self.make_meta());
        Ok(())
    }

    fn make_meta(&self) -> BatchMeta {
        let (label_names, noutputs) = if self.cfg.no_labels {
            (vec![], 0)
        } else {
            (self.setup.output_names(), self.setup.noutputs())
        };
        BatchMeta {
            num_cases_per_batch: self.geom.num_cases_per_batch,
            label_names,
            nlabels: self.setup.nlabels(),
            pixels_per_image: self.geom.pixels_per_image,
            noutputs,
        }
    }

    /// 批次描述. 尚未初始化时为 `None`.
    #[inline]
    pub fn meta(&self) -> Option<&BatchMeta> {
        self.meta.as_ref()
    }

    /// 配置.
    #[inline]
    pub fn config(&self) -> &ParserConfig {
        &self.cfg
    }

    /// 几何常量.
    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    /// 标签方案.
    #[inline]
    pub fn label_setup(&self) -> &LabelSetup {
        &self.setup
    }

    /// 当前块的立方体.
    #[inline]
    pub fn cubes(&self) -> &CubeStore {
        &self.cubes
    }

    /// 当前块的选择标签立方体.
    #[inline]
    pub fn selection(&self) -> Option<&Array3<u8>> {
        self.select.get()
    }

    /// 标签查找表. 关闭查表时为 `None`.
    #[inline]
    pub fn lookup(&self) -> Option<&LabelLookup> {
        self.lookup.as_ref()
    }

    /// 平铺索引. 尚未初始化时为 `None`.
    #[inline]
    pub fn tiled_index(&self) -> Option<&TiledIndex> {
        self.tiled.as_ref()
    }

    /// 块流状态. 单块模式下为 `None`.
    #[inline]
    pub fn chunk_state(&self) -> Option<StreamState> {
        self.chunks.as_ref().map(ChunkStream::state)
    }

    /// 块流控制器.
    #[inline]
    pub(crate) fn chunk_stream_mut(&mut self) -> Option<&mut ChunkStream> {
        self.chunks.as_mut()
    }

    /// 当前块解析出的 ECS 标签值.
    #[inline]
    pub fn ecs_value(&self) -> u32 {
        self.ecs
    }

    /// 原始数据集属性.
    #[inline]
    pub fn data_attrs(&self) -> &Attrs {
        &self.data_attrs
    }

    /// 原始数据集形状与块形状 (存储轴序).
    #[inline]
    pub fn data_info(&self) -> Option<DatasetInfo> {
        self.data_info
    }

    /// 当前块原始数据的均值与标准差.
    #[inline]
    pub fn data_stats(&self) -> (f64, f64) {
        (self.stats.mean, self.stats.std)
    }

    /// 与网络目标对应的空先验计数.
    pub fn prior_counts(&self) -> PriorCounts {
        if self.setup.independent() {
            PriorCounts::new(self.setup.noutputs())
        } else {
            PriorCounts::new(self.setup.nlabels())
        }
    }

    /// 生成编号为 `batchnum` 的批次.
    ///
    /// 非平铺且带标签的批次会累计到 `tally` 中.
    ///
    /// # 注意
    ///
    /// 块列表模式下可能先换块再取样.
    pub fn get_batch(
        &mut self,
        batchnum: u32,
        opts: &BatchOptions,
        tally: Option<&mut PriorCounts>,
    ) -> EmResult<Batch> {
        if self.meta.is_none() {
            return Err(EmError::NotInitialized);
        }
        let t = Instant::now();
        let regime = Regime::of(batchnum);
        let cases = match regime {
            Regime::Balanced => self.balanced_cases()?,
            Regime::Uniform => self.uniform_cases()?,
            Regime::Tiled => self.tiled_cases(batchnum, opts.tiled_aug)?,
        };

        let g = &self.geom;
        let cpb = g.num_cases_per_batch;
        let with_labels = !(self.cfg.no_labels || self.cfg.zero_labels);
        let noutputs = self.setup.noutputs();
        let (nl, ns) = if with_labels {
            (noutputs, g.pixels_per_seg_out)
        } else {
            (0, 0)
        };
        let mut batch = Batch {
            data: Array2::zeros((g.pixels_per_image, cpb)),
            aug_data: vec![Array2::zeros((g.pixels_per_image, cpb)); self.cubes.naug()],
            labels: Array2::zeros((nl, cpb)),
            seg_labels: Array2::zeros((ns, cpb)),
        };

        fill_images(self.cubes.data()?, g, &cases, &mut batch.data);
        for (i, out) in batch.aug_data.iter_mut().enumerate() {
            fill_images(self.cubes.aug(i)?, g, &cases, out);
        }
        if with_labels {
            if let (Some(select), Some(seg)) = (self.select.get(), self.cubes.seg()) {
                let src = LabelSource {
                    setup: &self.setup,
                    select,
                    seg,
                    ecs: self.ecs,
                };
                fill_labels(&src, g, &cases, &mut batch.labels, &mut batch.seg_labels);
            }
            if regime != Regime::Tiled {
                if let Some(c) = tally {
                    c.tally(&batch.labels, self.setup.independent());
                }
            }
        }
        if self.cfg.zero_labels {
            batch.labels = Array2::zeros((noutputs, cpb));
        }
        if !opts.for_display {
            self.normalize(&mut batch);
        }
        if self.cfg.verbose {
            debug!("batch {batchnum} ({regime:?}) in {:.3} s", t.elapsed().as_secs_f64());
        }
        Ok(batch)
    }

    fn normalize(&self, batch: &mut Batch) {
        let s = effective(self.cfg.em_mean, self.cfg.em_std, self.stats);
        standardize(&mut batch.data, s);
        for (i, a) in batch.aug_data.iter_mut().enumerate() {
            let mean = self.cfg.aug_mean.get(i).copied().unwrap_or(-1.0);
            let std = self.cfg.aug_std.get(i).copied().unwrap_or(-1.0);
            standardize(a, effective(mean, std, self.aug_stats[i]));
        }
    }

    /// 块列表模式下挑选随机批次所用的块, 必要时换块.
    fn next_rand_chunk(&mut self) -> EmResult<()> {
        let reload = match &mut self.chunks {
            Some(s) => {
                let c = s.next_rand_candidate(&mut self.rng)?;
                s.select(c, ChunkList::Rand)?.1
            }
            None => false,
        };
        if reload {
            self.reload(!self.cfg.verbose)?;
        }
        Ok(())
    }

    /// 查表样本: 先按先验抽标签, 再在其表中抽坐标, 最后在窗口内随机平移.
    fn balanced_cases(&mut self) -> EmResult<Vec<Case>> {
        if self.lookup.is_none() {
            return Err(EmError::RegimeUnavailable(
                "label-balanced batches need the label lookup",
            ));
        }
        self.next_rand_chunk()?;
        let Some(lookup) = &self.lookup else {
            return Err(EmError::NotInitialized);
        };
        let w = self.geom.image_out_offset;
        let mask = self.cfg.augs_mask;
        let mut cases = Vec::with_capacity(self.geom.num_cases_per_batch);
        for _ in 0..self.geom.num_cases_per_batch {
            let l = lookup.sample_label(&mut self.rng)?;
            let (x, y, z) = lookup
                .sample_index(&mut self.rng, l)
                .ok_or(EmError::AllLabelsEmpty)?;
            let (x, y) = if w > 1 {
                let r = self.rng.gen_range(0..w * w);
                (x + r / w - w / 2, y + r % w - w / 2)
            } else {
                (x, y)
            };
            cases.push(Case {
                pos: (x, y, z),
                aug: random_code(&mut self.rng, mask),
            });
        }
        Ok(cases)
    }

    /// 均匀样本: 在去除读块边界的随机区内均匀抽取, 丢弃 z 方向补丁越界的样本.
    fn uniform_cases(&mut self) -> EmResult<Vec<Case>> {
        self.next_rand_chunk()?;
        let g = &self.geom;
        let (size, offset) = if self.cfg.no_labels {
            (g.size_rand, g.labels_offset)
        } else {
            let rb = g.read_border;
            let size = [0, 1, 2].map(|d| g.size_rand[d].saturating_sub(2 * rb[d]));
            let offset = [0, 1, 2].map(|d| g.labels_offset[d] + rb[d]);
            (size, offset)
        };
        let zr = g.rand_z_centres();
        if size.contains(&0) || offset[2] + size[2] <= zr.start || offset[2] >= zr.end {
            return Err(EmError::RegimeUnavailable(
                "read border leaves no voxels for uniform batches",
            ));
        }
        let n = size.iter().product::<usize>();
        let cpb = g.num_cases_per_batch;
        let mask = self.cfg.augs_mask;
        let mut cases = Vec::with_capacity(cpb);
        while cases.len() < cpb {
            // 每轮多抽一倍, 补偿 z 过滤.
            for _ in 0..2 * cpb {
                let r = self.rng.gen_range(0..n);
                let pos = (
                    r / (size[1] * size[2]) + offset[0],
                    r / size[2] % size[1] + offset[1],
                    r % size[2] + offset[2],
                );
                if !zr.contains(&pos.2) {
                    continue;
                }
                cases.push(Case {
                    pos,
                    aug: random_code(&mut self.rng, mask),
                });
                if cases.len() == cpb {
                    break;
                }
            }
        }
        Ok(cases)
    }

    /// 块区间模式下平铺批次要求随机区恰好为一个存储块.
    fn check_range_tiling(&self) -> EmResult<()> {
        let Some(s) = &self.chunks else {
            return Ok(());
        };
        if !s.config().source.is_range() {
            return Ok(());
        }
        let info = self.data_info.ok_or(EmError::NotInitialized)?;
        let mut chunks = info.chunks;
        if !self.cfg.storage_c_order {
            chunks.reverse();
        }
        if chunks != self.cfg.size_rand {
            return Err(ConfigError::RangeNeedsChunkSizedRand {
                size_rand: self.cfg.size_rand,
                chunks,
            }
            .into());
        }
        Ok(())
    }

    /// 平铺样本: 批次编号解码为平铺起点与 z 切片.
    fn tiled_cases(&mut self, batchnum: u32, aug: u8) -> EmResult<Vec<Case>> {
        let g = &self.geom;
        let (bprc, bpz, cpb, zpb) = (
            g.batches_per_rand_cube,
            g.batches_per_zslice,
            g.num_cases_per_batch,
            g.zslices_per_batch,
        );
        let mut off = (batchnum - FIRST_TILED_BATCH) as usize;
        if self.chunks.is_some() {
            self.check_range_tiling()?;
            let chunk = off / bprc;
            off %= bprc;
            let reload = match &mut self.chunks {
                Some(s) => s.select(chunk, ChunkList::Tiled)?.1,
                None => false,
            };
            if reload {
                self.reload(!self.cfg.verbose)?;
            }
        }

        let g = &self.geom;
        let ind0 = (off % bpz) * cpb;
        let zslice = off / bpz * zpb + g.nzslices / 2;
        // 整个批次连同 z 邻域都必须落在缓冲区内.
        if zslice + zpb + g.nzslices / 2 > g.ntotal_zslice {
            return Err(EmError::TiledBatchOutOfRange {
                batchnum,
                zslice,
                ntotal: g.ntotal_zslice,
            });
        }
        let tiled = self.tiled.as_ref().ok_or(EmError::NotInitialized)?;
        Ok(tiled
            .batch(ind0, zslice)
            .map(|pos| Case { pos, aug })
            .collect())
    }
}
