use super::{checked_info, checked_region, AttrValue, Attrs, DatasetInfo, StoreError};
use super::{VolumeSink, VolumeStore};
use crate::geometry::Region;
use either::Either;
use ndarray::{s, Array3, ArrayView3, ArrayViewMut3, Ix3};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use num::ToPrimitive;
use std::collections::HashMap;
use std::path::Path;

/// 内存中的数据集: 强度数据为 `f32`, 分割标签为 `u32`.
#[derive(Clone, Debug)]
struct MemDataset {
    array: Either<Array3<f32>, Array3<u32>>,
    chunks: [usize; 3],
    attrs: Attrs,
}

impl MemDataset {
    fn shape(&self) -> [usize; 3] {
        let sh = either::for_both!(&self.array, a => a.shape());
        [sh[0], sh[1], sh[2]]
    }
}

/// 全部数据集驻留内存的存储.
///
/// 适用于测试, 消融实验, 以及能放入内存的小数据集.
#[derive(Clone, Debug, Default)]
pub struct MemStore {
    datasets: HashMap<String, MemDataset>,
}

impl MemStore {
    /// 创建空存储.
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入强度数据集. `data` 的形状即存储声明的形状.
    pub fn insert_data(
        &mut self,
        name: &str,
        data: Array3<f32>,
        chunks: [usize; 3],
    ) -> Result<(), StoreError> {
        self.insert(name, Either::Left(data), chunks)
    }

    /// 加入分割标签数据集.
    pub fn insert_labels(
        &mut self,
        name: &str,
        labels: Array3<u32>,
        chunks: [usize; 3],
    ) -> Result<(), StoreError> {
        self.insert(name, Either::Right(labels), chunks)
    }

    fn insert(
        &mut self,
        name: &str,
        array: Either<Array3<f32>, Array3<u32>>,
        chunks: [usize; 3],
    ) -> Result<(), StoreError> {
        let ds = MemDataset {
            array,
            chunks,
            attrs: Attrs::new(),
        };
        checked_info(DatasetInfo {
            shape: ds.shape(),
            chunks,
        })?;
        self.datasets.insert(name.to_string(), ds);
        Ok(())
    }

    /// 从 NIfTI 文件导入强度数据集.
    ///
    /// NIfTI 体按 `[x, y, z]` 组织, 与原始轴序一致, 因此按行优先声明.
    pub fn import_nifti<P: AsRef<Path>>(
        &mut self,
        path: P,
        name: &str,
        chunks: [usize; 3],
    ) -> Result<(), StoreError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()?
            .into_dimensionality::<Ix3>()?;
        // 保证行优先布局.
        let data = data.as_standard_layout().into_owned();
        self.insert_data(name, data, chunks)
    }

    /// 从 NIfTI 文件导入分割标签数据集. 负值与非整数值按 `u32` 饱和截断.
    pub fn import_nifti_labels<P: AsRef<Path>>(
        &mut self,
        path: P,
        name: &str,
        chunks: [usize; 3],
    ) -> Result<(), StoreError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let data = obj
            .into_volume()
            .into_ndarray::<f64>()?
            .into_dimensionality::<Ix3>()?;
        let labels = data.mapv(|v| v.to_u32().unwrap_or(0));
        self.insert_labels(name, labels.as_standard_layout().into_owned(), chunks)
    }

    /// 整个强度数据集.
    pub fn data(&self, name: &str) -> Result<&Array3<f32>, StoreError> {
        match &self.get(name)?.array {
            Either::Left(a) => Ok(a),
            Either::Right(_) => Err(StoreError::NoSuchDataset(name.to_string())),
        }
    }

    /// 数据集名称.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    fn get(&self, name: &str) -> Result<&MemDataset, StoreError> {
        self.datasets
            .get(name)
            .ok_or_else(|| StoreError::NoSuchDataset(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut MemDataset, StoreError> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| StoreError::NoSuchDataset(name.to_string()))
    }
}

/// 按区域切出存储视图.
#[inline]
fn region_view<'a, T>(a: &'a Array3<T>, b: [usize; 3], size: [usize; 3]) -> ArrayView3<'a, T> {
    a.slice(s![
        b[0]..b[0] + size[0],
        b[1]..b[1] + size[1],
        b[2]..b[2] + size[2]
    ])
}

impl VolumeStore for MemStore {
    fn info(&self, dataset: &str) -> Result<DatasetInfo, StoreError> {
        let ds = self.get(dataset)?;
        Ok(DatasetInfo {
            shape: ds.shape(),
            chunks: ds.chunks,
        })
    }

    fn attrs(&self, dataset: &str) -> Result<Attrs, StoreError> {
        Ok(self.get(dataset)?.attrs.clone())
    }

    fn read_data(
        &self,
        dataset: &str,
        region: &Region,
        mut dst: ArrayViewMut3<f32>,
    ) -> Result<(), StoreError> {
        let ds = self.get(dataset)?;
        let b = checked_region(dataset, region, ds.shape(), dst.shape())?;
        let size = region.size();
        match &ds.array {
            Either::Left(a) => dst.assign(&region_view(a, b, size)),
            Either::Right(a) => dst.zip_mut_with(&region_view(a, b, size), |d, &s| {
                *d = s.to_f32().unwrap_or_default()
            }),
        }
        Ok(())
    }

    fn read_labels(
        &self,
        dataset: &str,
        region: &Region,
        mut dst: ArrayViewMut3<u32>,
    ) -> Result<(), StoreError> {
        let ds = self.get(dataset)?;
        let b = checked_region(dataset, region, ds.shape(), dst.shape())?;
        match &ds.array {
            Either::Right(a) => dst.assign(&region_view(a, b, region.size())),
            Either::Left(_) => return Err(StoreError::NotLabels(dataset.to_string())),
        }
        Ok(())
    }
}

impl VolumeSink for MemStore {
    fn contains(&self, dataset: &str) -> bool {
        self.datasets.contains_key(dataset)
    }

    fn create(&mut self, dataset: &str, info: DatasetInfo, fill: f32) -> Result<(), StoreError> {
        let info = checked_info(info)?;
        if let Some(ds) = self.datasets.get(dataset) {
            let existing = ds.shape();
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
        self.insert_data(dataset, Array3::from_elem(info.shape, fill), info.chunks)
    }

    fn write_region(
        &mut self,
        dataset: &str,
        begin: [usize; 3],
        src: ArrayView3<f32>,
    ) -> Result<(), StoreError> {
        let ds = self.get_mut(dataset)?;
        let shape = ds.shape();
        let region = Region::from_size(begin.map(|b| b as i64), [0, 1, 2].map(|d| src.shape()[d]));
        let b = checked_region(dataset, &region, shape, src.shape())?;
        let size = region.size();
        match &mut ds.array {
            Either::Left(a) => {
                a.slice_mut(s![
                    b[0]..b[0] + size[0],
                    b[1]..b[1] + size[1],
                    b[2]..b[2] + size[2]
                ])
                .assign(&src);
                Ok(())
            }
            Either::Right(_) => Err(StoreError::NoSuchDataset(dataset.to_string())),
        }
    }

    fn set_attr(&mut self, dataset: &str, name: &str, value: AttrValue) -> Result<(), StoreError> {
        self.get_mut(dataset)?.attrs.insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn store() -> MemStore {
        let mut st = MemStore::new();
        let data = Array3::from_shape_fn((8, 8, 4), |(x, y, z)| (x * 100 + y * 10 + z) as f32);
        st.insert_data("data", data, [4, 4, 4]).unwrap();
        let labels = Array3::from_shape_fn((8, 8, 4), |(x, _, _)| x as u32);
        st.insert_labels("labels", labels, [4, 4, 4]).unwrap();
        st
    }

    #[test]
    fn test_read_region() {
        let st = store();
        let mut dst = Array3::<f32>::zeros((2, 3, 4));
        let r = Region::from_size([1, 2, 0], [2, 3, 4]);
        st.read_data("data", &r, dst.view_mut()).unwrap();
        assert_eq!(dst[(0, 0, 0)], 120.0);
        assert_eq!(dst[(1, 2, 3)], 243.0);

        // 标签数据集也可以作为强度数据读取.
        st.read_data("labels", &r, dst.view_mut()).unwrap();
        assert_eq!(dst[(1, 0, 0)], 2.0);
    }

    #[test]
    fn test_read_errors() {
        let st = store();
        let mut dst = Array3::<u32>::zeros((2, 2, 2));
        let r = Region::from_size([7, 0, 0], [2, 2, 2]);
        assert!(matches!(
            st.read_labels("labels", &r, dst.view_mut()),
            Err(StoreError::OutOfBounds { .. })
        ));
        let r = Region::from_size([0, 0, 0], [2, 2, 2]);
        assert!(matches!(
            st.read_labels("data", &r, dst.view_mut()),
            Err(StoreError::NotLabels(_))
        ));
        assert!(matches!(
            st.read_labels("nope", &r, dst.view_mut()),
            Err(StoreError::NoSuchDataset(_))
        ));
    }

    #[test]
    fn test_sink() {
        let mut st = MemStore::new();
        let info = DatasetInfo {
            shape: [4, 4, 4],
            chunks: [2, 2, 2],
        };
        st.create("probs", info, -1.0).unwrap();
        st.create("probs", info, -1.0).unwrap();
        let src = Array3::<f32>::ones((2, 2, 2));
        st.write_region("probs", [2, 2, 0], src.view()).unwrap();
        let d = st.data("probs").unwrap();
        assert_eq!(d[(3, 3, 1)], 1.0);
        assert_eq!(d[(1, 3, 1)], -1.0);
        assert!(st.write_region("probs", [3, 0, 0], src.view()).is_err());

        st.set_attr("probs", "prior_test", AttrValue::FloatVec(vec![0.5, 0.5]))
            .unwrap();
        assert_eq!(st.attrs("probs").unwrap().len(), 1);
    }
}
