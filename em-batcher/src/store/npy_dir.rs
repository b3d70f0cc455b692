use super::{checked_info, checked_region, AttrValue, Attrs, DatasetInfo, StoreError};
use super::{VolumeSink, VolumeStore};
use crate::geometry::Region;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::{s, Array3, ArrayView3, ArrayViewMut3};
use ndarray_npy::{read_npy, write_npy};
use num::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// 数据集元素类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
enum Kind {
    Data,
    Labels,
}

/// 旁路元数据.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Meta {
    kind: Kind,
    info: DatasetInfo,
    attrs: Attrs,
}

/// 目录存储: 数据集 `name` 对应 `name.npy` 和 zlib 压缩的 bincode 元数据 `name.meta`.
///
/// 每次区域读取都会载入整个 `.npy` 文件, 适合小到中等规模的数据集和离线导出.
#[derive(Clone, Debug)]
pub struct NpyDirStore {
    root: PathBuf,
}

impl NpyDirStore {
    /// 以目录 `root` 打开存储, 目录不存在时创建.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// 存储根目录.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 写入完整的强度数据集.
    pub fn put_data(
        &self,
        name: &str,
        data: &Array3<f32>,
        chunks: [usize; 3],
    ) -> Result<(), StoreError> {
        let info = checked_info(DatasetInfo {
            shape: shape_of(data.shape()),
            chunks,
        })?;
        write_npy(self.npy_path(name), data)?;
        self.write_meta(
            name,
            &Meta {
                kind: Kind::Data,
                info,
                attrs: Attrs::new(),
            },
        )
    }

    /// 写入完整的分割标签数据集.
    pub fn put_labels(
        &self,
        name: &str,
        labels: &Array3<u32>,
        chunks: [usize; 3],
    ) -> Result<(), StoreError> {
        let info = checked_info(DatasetInfo {
            shape: shape_of(labels.shape()),
            chunks,
        })?;
        write_npy(self.npy_path(name), labels)?;
        self.write_meta(
            name,
            &Meta {
                kind: Kind::Labels,
                info,
                attrs: Attrs::new(),
            },
        )
    }

    /// 读取完整的强度数据集.
    pub fn get_data(&self, name: &str) -> Result<Array3<f32>, StoreError> {
        let meta = self.read_meta(name)?;
        match meta.kind {
            Kind::Data => Ok(read_npy(self.npy_path(name))?),
            Kind::Labels => {
                let a: Array3<u32> = read_npy(self.npy_path(name))?;
                Ok(a.mapv(|v| v.to_f32().unwrap_or_default()))
            }
        }
    }

    fn npy_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.npy"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.meta"))
    }

    fn read_meta(&self, name: &str) -> Result<Meta, StoreError> {
        let path = self.meta_path(name);
        if !path.is_file() {
            return Err(StoreError::NoSuchDataset(name.to_string()));
        }
        let mut d = ZlibDecoder::new(File::open(path)?);
        let mut buf = Vec::new();
        d.read_to_end(&mut buf)?;
        Ok(bincode::deserialize(&buf)?)
    }

    fn write_meta(&self, name: &str, meta: &Meta) -> Result<(), StoreError> {
        let buf = bincode::serialize(meta)?;
        let mut e = ZlibEncoder::new(File::create(self.meta_path(name))?, Compression::best());
        e.write_all(&buf)?;
        e.finish()?;
        Ok(())
    }
}

#[inline]
fn shape_of(sh: &[usize]) -> [usize; 3] {
    [sh[0], sh[1], sh[2]]
}

impl VolumeStore for NpyDirStore {
    fn info(&self, dataset: &str) -> Result<DatasetInfo, StoreError> {
        Ok(self.read_meta(dataset)?.info)
    }

    fn attrs(&self, dataset: &str) -> Result<Attrs, StoreError> {
        Ok(self.read_meta(dataset)?.attrs)
    }

    fn read_data(
        &self,
        dataset: &str,
        region: &Region,
        mut dst: ArrayViewMut3<f32>,
    ) -> Result<(), StoreError> {
        let meta = self.read_meta(dataset)?;
        let b = checked_region(dataset, region, meta.info.shape, dst.shape())?;
        let e = [0, 1, 2].map(|d| b[d] + region.size()[d]);
        match meta.kind {
            Kind::Data => {
                let a: Array3<f32> = read_npy(self.npy_path(dataset))?;
                dst.assign(&a.slice(s![b[0]..e[0], b[1]..e[1], b[2]..e[2]]));
            }
            Kind::Labels => {
                let a: Array3<u32> = read_npy(self.npy_path(dataset))?;
                dst.zip_mut_with(&a.slice(s![b[0]..e[0], b[1]..e[1], b[2]..e[2]]), |d, &s| {
                    *d = s.to_f32().unwrap_or_default()
                });
            }
        }
        Ok(())
    }

    fn read_labels(
        &self,
        dataset: &str,
        region: &Region,
        mut dst: ArrayViewMut3<u32>,
    ) -> Result<(), StoreError> {
        let meta = self.read_meta(dataset)?;
        if meta.kind != Kind::Labels {
            return Err(StoreError::NotLabels(dataset.to_string()));
        }
        let b = checked_region(dataset, region, meta.info.shape, dst.shape())?;
        let e = [0, 1, 2].map(|d| b[d] + region.size()[d]);
        let a: Array3<u32> = read_npy(self.npy_path(dataset))?;
        dst.assign(&a.slice(s![b[0]..e[0], b[1]..e[1], b[2]..e[2]]));
        Ok(())
    }
}

impl VolumeSink for NpyDirStore {
    fn contains(&self, dataset: &str) -> bool {
        self.meta_path(dataset).is_file()
    }

    fn create(&mut self, dataset: &str, info: DatasetInfo, fill: f32) -> Result<(), StoreError> {
        let info = checked_info(info)?;
        if self.contains(dataset) {
            let existing = self.read_meta(dataset)?.info.shape;
            return if existing == info.shape {
                Ok(())
            } else {
                Err(StoreError::Exists {
                    dataset: dataset.to_string(),
                    existing,
                    requested: info.shape,
                })
            };
        }
        self.put_data(dataset, &Array3::from_elem(info.shape, fill), info.chunks)
    }

    fn write_region(
        &mut self,
        dataset: &str,
        begin: [usize; 3],
        src: ArrayView3<f32>,
    ) -> Result<(), StoreError> {
        let meta = self.read_meta(dataset)?;
        if meta.kind != Kind::Data {
            return Err(StoreError::NoSuchDataset(dataset.to_string()));
        }
        let region = Region::from_size(begin.map(|b| b as i64), shape_of(src.shape()));
        let b = checked_region(dataset, &region, meta.info.shape, src.shape())?;
        let e = [0, 1, 2].map(|d| b[d] + region.size()[d]);
        let mut a: Array3<f32> = read_npy(self.npy_path(dataset))?;
        a.slice_mut(s![b[0]..e[0], b[1]..e[1], b[2]..e[2]])
            .assign(&src);
        write_npy(self.npy_path(dataset), &a)?;
        Ok(())
    }

    fn set_attr(&mut self, dataset: &str, name: &str, value: AttrValue) -> Result<(), StoreError> {
        let mut meta = self.read_meta(dataset)?;
        meta.attrs.insert(name.to_string(), value);
        self.write_meta(dataset, &meta)
    }
}
