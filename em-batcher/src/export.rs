//! 验证导出.
//!
//! 把当前块的缓冲立方体, 索引与统计信息写出, 便于离线核对批次生成.

use crate::batch::BatchGenerator;
use crate::consts::names::{INFO_FILE, OUTPUT_CUBES_IN};
use crate::error::{EmError, EmResult};
use crate::lookup::enumerate_tiled;
use crate::store::VolumeStore;
use crate::Idx3dU16;
use log::info;
use ndarray::Array2;
use ndarray_npy::NpzWriter;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const S4: &str = "    ";

/// 以逗号连接的先验.
fn join_priors(p: &[f64]) -> String {
    p.iter()
        .map(|v| format!("{v:.8}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// 写出文本报告: 随机区与平铺区的标签计数和先验, 尺寸与统计量.
pub fn write_info<S: VolumeStore, W: Write>(gen: &BatchGenerator<S>, mut w: W) -> EmResult<()> {
    let g = gen.geometry();
    let names = gen.label_setup().label_names();
    let configured = gen.lookup().map(|lk| lk.priors().to_vec());

    if let Some(lk) = gen.lookup() {
        let lens = lk.lens();
        writeln!(w, "Total voxels included for random batches {}", lens.iter().sum::<usize>())?;
        for (i, name) in names.iter().enumerate() {
            writeln!(
                w,
                "{S4}label {i} {name}: fraction {:.8}, count {}, use prior {:.8}",
                lk.rand_priors()[i],
                lens[i],
                lk.priors()[i]
            )?;
        }
        writeln!(w, "Sum of random fractions = {:.3}", lk.rand_priors().iter().sum::<f64>())?;
    }

    let census = gen
        .selection()
        .map(|sel| enumerate_tiled(sel, g, names.len()))
        .unwrap_or_default();
    let tiled = census.priors();
    writeln!(w, "Total voxels included for tiled {}", census.total)?;
    if let Some(p) = &tiled {
        for (i, name) in names.iter().enumerate() {
            writeln!(w, "{S4}label {i} {name}: fraction {:.8}, count {}", p[i], census.counts[i])?;
        }
    }
    writeln!(w)?;

    if let Some(p) = &configured {
        writeln!(w, "Priors train: {}", join_priors(p))?;
    }
    if let Some(p) = &tiled {
        writeln!(w, "Priors test:  {}", join_priors(p))?;
    }
    if let Some(lk) = gen.lookup() {
        writeln!(w, "Priors rand:  {}", join_priors(lk.rand_priors()))?;
    }
    writeln!(w)?;

    let [dx, dy, dz] = g.data_slice_size;
    let [lx, ly, lz] = g.labels_slice_size;
    let [tx, ty, tz] = g.tile_size;
    let [sx, sy, sz] = g.shape_per_batch;
    writeln!(w, "data_shape {dx}x{dy}x{dz} labels_shape {lx}x{ly}x{lz}")?;
    writeln!(
        w,
        "num_rand_zslices {}, num_tiled_zslices {}, zslice size {}x{}",
        g.size_rand[2], g.nz_tiled, g.size_rand[0], g.size_rand[1]
    )?;
    writeln!(
        w,
        "num_cases_per_batch {}, tiles_per_zslice {}x{}",
        g.num_cases_per_batch, g.tiles_per_zslice[0], g.tiles_per_zslice[1]
    )?;
    writeln!(
        w,
        "image_out_size {}, tile_size {tx}x{ty}x{tz}, shape_per_batch {sx}x{sy}x{sz}",
        g.image_out_size
    )?;
    let (mean, std) = gen.data_stats();
    writeln!(
        w,
        "data specified mean {:.4}, actual mean {mean:.4}, actual std {std:.4}",
        gen.config().em_mean
    )?;
    Ok(())
}

/// 写出 `dir/batch.info`.
pub fn write_info_file<S: VolumeStore, P: AsRef<Path>>(gen: &BatchGenerator<S>, dir: P) -> EmResult<PathBuf> {
    std::fs::create_dir_all(dir.as_ref())?;
    let path = dir.as_ref().join(INFO_FILE);
    let mut w = BufWriter::new(File::create(&path)?);
    write_info(gen, &mut w)?;
    w.flush()?;
    Ok(path)
}

/// 坐标表转为 `[n, 3]` 数组.
fn index_table(t: &[Idx3dU16]) -> Array2<u16> {
    Array2::from_shape_fn((t.len(), 3), |(i, d)| match d {
        0 => t[i].0,
        1 => t[i].1,
        _ => t[i].2,
    })
}

/// 写出 `dir/batch_input_data.npz`.
///
/// 包含列优先 (z, y, x) 的数据立方体, 选择标签与分割标签立方体 (有标签时),
/// 平铺正向索引与各标签查找表 (`[n, 3]`, 数据立方体坐标).
pub fn write_input_cubes<S: VolumeStore, P: AsRef<Path>>(gen: &BatchGenerator<S>, dir: P) -> EmResult<PathBuf> {
    std::fs::create_dir_all(dir.as_ref())?;
    let path = dir.as_ref().join(OUTPUT_CUBES_IN);
    let mut npz = NpzWriter::new_compressed(File::create(&path)?);

    let cubes = gen.cubes();
    npz.add_array("data", &cubes.data()?.view().reversed_axes())?;
    if let (Some(sel), Some(seg)) = (gen.selection(), cubes.seg()) {
        npz.add_array("labels", &sel.view().reversed_axes())?;
        npz.add_array("segmented_labels", &seg.view().reversed_axes())?;
    }
    let tiled = gen.tiled_index().ok_or(EmError::NotInitialized)?;
    npz.add_array("tiled_indices", &index_table(tiled.forward()))?;
    if let Some(lk) = gen.lookup() {
        for i in 0..lk.nlabels() {
            npz.add_array(format!("inds_label_lookup_{i}"), &index_table(lk.table(i)))?;
        }
    }
    npz.finish()?;
    Ok(path)
}

/// 写出全部验证文件.
pub fn export_validation<S: VolumeStore, P: AsRef<Path>>(gen: &BatchGenerator<S>, dir: P) -> EmResult<()> {
    let report = write_info_file(gen, dir.as_ref())?;
    let cubes = write_input_cubes(gen, dir.as_ref())?;
    info!("exported validation files {} and {}", report.display(), cubes.display());
    Ok(())
}
