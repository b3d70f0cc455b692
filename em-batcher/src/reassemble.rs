//! 概率体重组.
//!
//! 网络对平铺批次的输出按平铺逆向索引散射回一个 `(x, y, z, 类别)` 概率体.
//! 缺失的批次只记录日志, 对应体素保持 [`EMPTY_PROB`].
//!
//! 可选的贝叶斯先验重加权只作用于读入的输出副本, 不修改批次源.

use crate::batch::{BatchGenerator, PriorCounts};
use crate::config::ConfigError;
use crate::consts::batch_range::FIRST_TILED_BATCH;
use crate::consts::names::{batch_file, OUTPUT_CUBES_OUT, PRIOR_DATASET};
use crate::consts::EMPTY_PROB;
use crate::cube::ChunkPos;
use crate::error::{EmError, EmResult};
use crate::geometry::addressing::reversed;
use crate::geometry::hdf_index_from_chunk_index;
use crate::labels::LabelSetup;
use crate::store::{AttrValue, DatasetInfo, StoreError, VolumeSink, VolumeStore};
use crate::Idx3dU16;
use log::{debug, info};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, Axis};
use ndarray_npy::{read_npy, NpzWriter};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// 网络导出的批次输出.
pub trait BatchOutputSource {
    /// 取出批次 `batchnum` 的输出, 形状为 `[样本数, 输出数]`. 不存在时返回 `None`.
    fn take(&mut self, batchnum: u32) -> EmResult<Option<Array2<f32>>>;
}

/// 目录中的 `data_batch_{n}.npy` 文件.
#[derive(Clone, Debug)]
pub struct NpyBatchDir {
    root: PathBuf,
    remove_after_read: bool,
}

impl NpyBatchDir {
    /// 读取 `root` 中的批次输出. `remove_after_read` 为真时读后删除 (追加写出模式).
    pub fn new<P: AsRef<Path>>(root: P, remove_after_read: bool) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            remove_after_read,
        }
    }

    /// 批次 `batchnum` 的文件路径.
    #[inline]
    pub fn path(&self, batchnum: u32) -> PathBuf {
        self.root.join(batch_file(batchnum))
    }
}

impl BatchOutputSource for NpyBatchDir {
    fn take(&mut self, batchnum: u32) -> EmResult<Option<Array2<f32>>> {
        let path = self.path(batchnum);
        if !path.is_file() {
            return Ok(None);
        }
        let d: Array2<f32> = read_npy(&path)?;
        if self.remove_after_read {
            std::fs::remove_file(&path)?;
        }
        Ok(Some(d))
    }
}

/// 驻留内存的批次输出.
#[derive(Clone, Debug, Default)]
pub struct MemBatchOutputs {
    batches: HashMap<u32, Array2<f32>>,
}

impl MemBatchOutputs {
    /// 空集合.
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入批次 `batchnum` 的输出.
    pub fn insert(&mut self, batchnum: u32, d: Array2<f32>) {
        self.batches.insert(batchnum, d);
    }

    /// 剩余批次数.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// 是否已取空.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl BatchOutputSource for MemBatchOutputs {
    fn take(&mut self, batchnum: u32) -> EmResult<Option<Array2<f32>>> {
        Ok(self.batches.remove(&batchnum))
    }
}

/// 贝叶斯先验重加权.
///
/// 每个比值矩阵的形状为 `[每样本输出像素数, 类别数]`, 行对应输出像素.
#[derive(Clone, Debug, PartialEq)]
pub enum Reweight {
    /// 互斥标签: 乘以 `测试先验 / 训练先验` 后在类别上重新归一化.
    Exclusive {
        /// 各类别的先验比值.
        ratio: Array2<f64>,
    },

    /// 独立标签, 每个输出与其补集单独重加权.
    Complement {
        /// 先验比值.
        ratio: Array2<f64>,
        /// 补集的先验比值.
        not_ratio: Array2<f64>,
    },

    /// 独立标签, 在每个输出像素的全部独立标签上重新归一化.
    Shared {
        /// 先验比值.
        ratio: Array2<f64>,
    },

    /// 独立标签加一个隐式类别 (全零编码, 概率为 `1 - 其余之和`).
    ImplicitZero {
        /// 先验比值, 最后一列为隐式类别.
        ratio: Array2<f64>,
    },
}

/// 检查测试先验: 各分量在 `(0, 1)` 内, 非逐类时和为 1.
fn check_test_prior(test: &[f64], per_class: bool) -> Result<(), ConfigError> {
    let in_range = test.iter().all(|&p| p > 0.0 && p < 1.0);
    let sums = per_class || (test.iter().sum::<f64>() - 1.0).abs() < 1e-6;
    if in_range && sums {
        Ok(())
    } else {
        Err(ConfigError::InvalidPrior {
            what: "prior_test",
            values: test.to_vec(),
        })
    }
}

impl Reweight {
    /// 由测试先验与训练先验构造.
    ///
    /// `train` 按网络输出排列: 独立标签时为每个输出像素的每个独立标签, 否则为每个选择标签.
    ///
    /// # 注意
    ///
    /// 独立标签且非逐类重加权时, `test` 可以比独立标签多一项, 即隐式类别的先验.
    pub fn new(
        setup: &LabelSetup,
        test: &[f64],
        per_class: bool,
        train: &[f64],
    ) -> Result<Self, ConfigError> {
        let independent = setup.independent();
        let per_class = independent && per_class;
        check_test_prior(test, per_class)?;

        let (npix, nl) = if independent {
            let ios = setup.image_out_size();
            (ios * ios, setup.n_indep())
        } else {
            (1, setup.nlabels())
        };
        if train.len() != npix * nl {
            return Err(ConfigError::PriorLength {
                what: "prior_train",
                got: train.len(),
                expected: npix * nl,
            });
        }
        let length = |expected: usize| {
            if test.len() == expected {
                Ok(())
            } else {
                Err(ConfigError::PriorLength {
                    what: "prior_test",
                    got: test.len(),
                    expected,
                })
            }
        };
        let ratio = |n: usize| Array2::from_shape_fn((npix, n), |(p, j)| test[j] / train[p * nl + j]);

        let w = if !independent {
            length(nl)?;
            Self::Exclusive { ratio: ratio(nl) }
        } else if per_class {
            length(nl)?;
            Self::Complement {
                ratio: ratio(nl),
                not_ratio: Array2::from_shape_fn((npix, nl), |(p, j)| {
                    (1.0 - test[j]) / (1.0 - train[p * nl + j])
                }),
            }
        } else if test.len() == nl {
            Self::Shared { ratio: ratio(nl) }
        } else {
            length(nl + 1)?;
            Self::ImplicitZero {
                ratio: Array2::from_shape_fn((npix, nl + 1), |(p, j)| {
                    if j < nl {
                        test[j] / train[p * nl + j]
                    } else {
                        let rest: f64 = train[p * nl..(p + 1) * nl].iter().sum();
                        test[nl] / (1.0 - rest)
                    }
                }),
            }
        };

        let finite = match &w {
            Self::Complement { ratio, not_ratio } => {
                ratio.iter().chain(not_ratio.iter()).all(|r| r.is_finite())
            }
            Self::Exclusive { ratio } | Self::Shared { ratio } | Self::ImplicitZero { ratio } => {
                ratio.iter().all(|r| r.is_finite())
            }
        };
        if !finite {
            return Err(ConfigError::InvalidPrior {
                what: "prior_train",
                values: train.to_vec(),
            });
        }
        Ok(w)
    }

    /// 对一个批次的输出 (`[样本数, 输出数]`) 重加权.
    pub fn apply(&self, d: &mut Array2<f32>) {
        for mut row in d.rows_mut() {
            match self {
                Self::Exclusive { ratio } | Self::Shared { ratio } => {
                    let nl = ratio.ncols();
                    for (p, r) in ratio.rows().into_iter().enumerate() {
                        let mut px = row.slice_mut(s![p * nl..(p + 1) * nl]);
                        let sum: f64 = px.iter().zip(r).map(|(&v, &r)| v as f64 * r).sum();
                        if sum > 0.0 {
                            px.iter_mut()
                                .zip(r)
                                .for_each(|(v, &r)| *v = (*v as f64 * r / sum) as f32);
                        }
                    }
                }
                Self::Complement { ratio, not_ratio } => {
                    for ((v, &r), &nr) in row.iter_mut().zip(ratio).zip(not_ratio) {
                        let d = *v as f64;
                        let adjusted = d * r;
                        *v = (adjusted / (adjusted + (1.0 - d) * nr)) as f32;
                    }
                }
                Self::ImplicitZero { ratio } => {
                    let nl = ratio.ncols() - 1;
                    for (p, r) in ratio.rows().into_iter().enumerate() {
                        let mut px = row.slice_mut(s![p * nl..(p + 1) * nl]);
                        let labelled: f64 = px.iter().map(|&v| v as f64).sum();
                        let denom = px.iter().zip(&r).map(|(&v, &r)| v as f64 * r).sum::<f64>()
                            + (1.0 - labelled) * r[nl];
                        if denom > 0.0 {
                            px.iter_mut()
                                .zip(&r)
                                .for_each(|(v, &r)| *v = (*v as f64 * r / denom) as f32);
                        }
                    }
                }
            }
        }
    }
}

/// 概率体写出目标.
pub enum OutputTarget<'a> {
    /// 在目录下写出逐类别的压缩 npz 归档.
    Npz(&'a Path),

    /// 追加到跨越整个数据集的存储, 写在上一个块的位置.
    Append(&'a mut dyn VolumeSink),
}

/// 概率体重组器.
///
/// # 注意
///
/// 1. 概率体只分配一次, 每次重组前重新填充为 [`EMPTY_PROB`].
/// 2. 多像素输出中, 第 `p` 个输出像素的第 `j` 个类别位于第 `p * 类别数 + j` 列,
///   输出像素按行优先排列在 `image_out_size` 见方的补丁中.
#[derive(Clone, Debug)]
pub struct Reassembler {
    probs: Array4<f32>,
    names: Vec<String>,
    ios: usize,
    npix: usize,
    reweight: Option<Reweight>,
    prior_train: Option<Vec<f64>>,
    prior_test: Vec<f64>,
}

impl Reassembler {
    /// 为已初始化的生成器创建重组器.
    ///
    /// 提供 `counts` 且配置了测试先验时启用先验重加权.
    pub fn new<S: VolumeStore>(gen: &BatchGenerator<S>, counts: Option<&PriorCounts>) -> EmResult<Self> {
        let g = gen.geometry();
        let setup = gen.label_setup();
        let cfg = gen.config();
        let (names, npix) = if setup.independent() {
            (setup.indep_names(), g.pixels_per_out_image)
        } else {
            (setup.label_names(), 1)
        };
        let prior_train = counts.and_then(PriorCounts::train_priors);
        let reweight = match &prior_train {
            Some(train) if !cfg.prior_test.is_empty() => Some(Reweight::new(
                setup,
                &cfg.prior_test,
                cfg.prior_test_indep,
                train,
            )?),
            _ => None,
        };
        let [lx, ly, lz] = g.labels_slice_size;
        Ok(Self {
            probs: Array4::from_elem((lx, ly, lz, names.len()), EMPTY_PROB),
            names: names.iter().map(|s| s.to_string()).collect(),
            ios: g.image_out_size,
            npix,
            reweight,
            prior_train,
            prior_test: cfg.prior_test.clone(),
        })
    }

    /// 概率体, `(x, y, z, 类别)`.
    #[inline]
    pub fn probs(&self) -> &Array4<f32> {
        &self.probs
    }

    /// 第 `n` 个类别的概率体.
    #[inline]
    pub fn class_volume(&self, n: usize) -> ArrayView3<f32> {
        self.probs.index_axis(Axis(3), n)
    }

    /// 类别名称.
    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// 先验重加权. 未启用时为 `None`.
    #[inline]
    pub fn reweight(&self) -> Option<&Reweight> {
        self.reweight.as_ref()
    }

    /// 从 `first_batch` 起读取一个立方体的全部平铺批次输出并散射, 返回找到的批次数.
    ///
    /// 块列表模式下只覆盖随机区的 z 切片.
    pub fn reassemble<S, B>(&mut self, gen: &BatchGenerator<S>, src: &mut B, first_batch: u32) -> EmResult<usize>
    where
        S: VolumeStore,
        B: BatchOutputSource + ?Sized,
    {
        let g = gen.geometry();
        let tiled = gen.tiled_index().ok_or(EmError::NotInitialized)?;
        let cpb = g.num_cases_per_batch;
        let nl = self.names.len();
        let expected = (cpb, self.npix * nl);
        let nz = if gen.chunk_state().is_some() {
            g.nrand_zslice
        } else {
            g.ntotal_zslice
        };

        self.probs.fill(EMPTY_PROB);
        let (mut batchnum, mut found, mut total) = (first_batch, 0, 0);
        for z in (0..nz).step_by(g.zslices_per_batch) {
            for t in 0..g.batches_per_zslice {
                total += 1;
                let Some(mut d) = src.take(batchnum)? else {
                    debug!("no output for batch {batchnum}");
                    batchnum += 1;
                    continue;
                };
                if d.dim() != expected {
                    return Err(EmError::BatchShape {
                        batchnum,
                        got: d.dim(),
                        expected,
                    });
                }
                if let Some(w) = &self.reweight {
                    w.apply(&mut d);
                }
                self.scatter(tiled.batch_inverse(t * cpb), z, &d);
                found += 1;
                batchnum += 1;
            }
        }
        info!("reassembled {found} of {total} batches starting at {first_batch}");
        Ok(found)
    }

    fn scatter(&mut self, inv: &[Idx3dU16], z: usize, d: &Array2<f32>) {
        let (ios, nl) = (self.ios, self.names.len());
        let lz = self.probs.dim().2;
        for (row, &(ox, oy, oz)) in d.rows().into_iter().zip(inv) {
            let zz = oz as usize + z;
            if zz >= lz {
                continue;
            }
            for p in 0..self.npix {
                let x = ox as usize * ios + p / ios;
                let y = oy as usize * ios + p % ios;
                for j in 0..nl {
                    self.probs[(x, y, zz, j)] = row[p * nl + j];
                }
            }
        }
    }

    /// 训练先验, 形状为 `(类别, ios, ios)`.
    fn prior_volume(&self) -> Option<Array3<f32>> {
        let p = self.prior_train.as_ref()?;
        let side = if self.npix > 1 { self.ios } else { 1 };
        let nl = self.names.len();
        Some(Array3::from_shape_fn((nl, side, side), |(j, y, x)| {
            p[(x * side + y) * nl + j] as f32
        }))
    }

    /// 写出 `dir/batch_output_data.npz`: 每个类别一个列优先 (z, y, x) 数组, 以及训练先验.
    pub fn write_npz<P: AsRef<Path>>(&self, dir: P) -> EmResult<PathBuf> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(OUTPUT_CUBES_OUT);
        let mut npz = NpzWriter::new_compressed(File::create(&path)?);
        for (n, name) in self.names.iter().enumerate() {
            npz.add_array(name.as_str(), &self.class_volume(n).reversed_axes())?;
        }
        if let Some(p) = self.prior_volume() {
            npz.add_array(PRIOR_DATASET, &p)?;
            if self.reweight.is_some() {
                npz.add_array("prior_test", &Array1::from(self.prior_test.clone()))?;
            }
        }
        npz.finish()?;
        info!("wrote label probabilities to {}", path.display());
        Ok(path)
    }

    /// 追加到跨越整个数据集的存储.
    ///
    /// 每个类别一个数据集, 形状为重切片后数据集形状的逆序 (列优先),
    /// 首次使用时创建并以 [`EMPTY_PROB`] 填充. 只写出随机区, 位置为上一个块.
    pub fn append_to<S, K>(&self, gen: &BatchGenerator<S>, sink: &mut K) -> EmResult<()>
    where
        S: VolumeStore,
        K: VolumeSink + ?Sized,
    {
        let g = gen.geometry();
        if g.has_tiled() {
            return Err(ConfigError::AppendWithTiled.into());
        }
        let cfg = gen.config();
        let info = gen.data_info().ok_or(EmError::NotInitialized)?;
        let layout = gen.cubes().layout();
        let native = |v: [usize; 3]| if layout.c_order { v } else { reversed(v) };
        let out_info = DatasetInfo {
            shape: reversed(g.ordering.apply(native(info.shape))),
            chunks: reversed(g.ordering.apply(native(info.chunks))),
        };

        let created = !self.names.iter().all(|n| sink.contains(n));
        for name in &self.names {
            sink.create(name, out_info, EMPTY_PROB)?;
            if created {
                for (k, v) in gen.data_attrs() {
                    sink.set_attr(name, k, v.clone())?;
                }
            }
        }

        let pos = gen
            .chunk_state()
            .and_then(|s| s.previous())
            .unwrap_or(ChunkPos::new(cfg.chunk_rand, cfg.offset_rand));
        let begin = hdf_index_from_chunk_index(
            info.shape,
            info.chunks,
            pos.chunk,
            pos.offset,
            layout.origin_centered,
            layout.c_order,
        );
        let begin = reversed(g.ordering.apply(begin));
        if begin.iter().any(|&b| b < 0) {
            let size = reversed(g.size_rand);
            return Err(StoreError::OutOfBounds {
                dataset: self.names[0].clone(),
                begin,
                end: [0, 1, 2].map(|d| begin[d] + size[d] as i64),
                shape: out_info.shape,
            }
            .into());
        }
        let begin = begin.map(|b| b as usize);
        for (n, name) in self.names.iter().enumerate() {
            let v = self.class_volume(n);
            let v = v.slice(s![.., .., ..g.size_rand[2]]).reversed_axes();
            sink.write_region(name, begin, v)?;
        }
        info!("appended label probabilities at chunk {:?} offset {:?}", pos.chunk, pos.offset);

        if created {
            if let Some(p) = self.prior_volume() {
                let shape = [p.dim().0, p.dim().1, p.dim().2];
                sink.create(PRIOR_DATASET, DatasetInfo { shape, chunks: shape }, 0.0)?;
                sink.write_region(PRIOR_DATASET, [0, 0, 0], p.view())?;
                if self.reweight.is_some() {
                    sink.set_attr(PRIOR_DATASET, "prior_test", AttrValue::FloatVec(self.prior_test.clone()))?;
                    info!("exported with Bayesian prior reweighting");
                } else {
                    info!("exported training prior but outputs are not reweighted");
                }
            }
        }
        Ok(())
    }

    /// 重组并写出.
    pub fn make_output_cubes<S, B>(
        &mut self,
        gen: &BatchGenerator<S>,
        src: &mut B,
        first_batch: u32,
        target: &mut OutputTarget,
    ) -> EmResult<()>
    where
        S: VolumeStore,
        B: BatchOutputSource + ?Sized,
    {
        self.reassemble(gen, src, first_batch)?;
        match target {
            OutputTarget::Npz(dir) => {
                self.write_npz(*dir)?;
            }
            OutputTarget::Append(sink) => self.append_to(gen, &mut **sink)?,
        }
        Ok(())
    }

    /// 在批次 `batchnum` 的输出导出后调用, 需要时重组并写出, 返回是否写出.
    ///
    /// # 注意
    ///
    /// 1. 单块模式下只在最后一个批次后写出.
    /// 2. 块列表模式下在每个块的最后一个批次后写出该块; 写出后块流认为上一块已完成,
    ///   避免最后一块在下一块尚未载入时被重复写出.
    pub fn check_output_cubes<S, B>(
        &mut self,
        gen: &mut BatchGenerator<S>,
        src: &mut B,
        target: &mut OutputTarget,
        batchnum: u32,
        is_last: bool,
    ) -> EmResult<bool>
    where
        S: VolumeStore,
        B: BatchOutputSource + ?Sized,
    {
        if gen.chunk_state().is_none() {
            if is_last {
                self.make_output_cubes(gen, src, FIRST_TILED_BATCH, target)?;
            }
            return Ok(is_last);
        }
        let bprc = gen.geometry().batches_per_rand_cube as u32;
        let off = batchnum.saturating_sub(FIRST_TILED_BATCH);
        let (chunk, boff) = (off / bprc, off % bprc);
        if !is_last && boff != bprc - 1 {
            return Ok(false);
        }
        self.make_output_cubes(gen, src, chunk * bprc + FIRST_TILED_BATCH, target)?;
        if let Some(s) = gen.chunk_stream_mut() {
            s.settle();
        }
        Ok(true)
    }
}
