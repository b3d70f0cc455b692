//! 当前块的内存立方体.
//!
//! 立方体只分配一次. 换块时通过存储轴序视图原地重新填充, 不重新分配.
//! 对外只提供规范轴序的只读视图.

use crate::error::{EmError, EmResult};
use crate::geometry::{hdf_index_from_chunk_index, Geometry};
use crate::store::{Attrs, DatasetInfo, StoreError, VolumeStore};
use ndarray::{Array3, ArrayViewMut3, Axis, Slice};
use num::ToPrimitive;

/// 一个区域在存储中的位置: 块坐标和块内体素偏移 (原始轴序).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ChunkPos {
    /// 块坐标.
    pub chunk: [i64; 3],

    /// 块内体素偏移.
    pub offset: [usize; 3],
}

impl ChunkPos {
    /// 构造.
    #[inline]
    pub const fn new(chunk: [i64; 3], offset: [usize; 3]) -> Self {
        Self { chunk, offset }
    }
}

/// 立方体槽位: 尚未分配, 或已分配并填充.
#[derive(Clone, Debug, Default)]
pub enum CubeSlot<T> {
    /// 尚未分配.
    #[default]
    Empty,

    /// 已填充的规范轴序立方体.
    Loaded(Array3<T>),
}

impl<T> CubeSlot<T> {
    /// 已填充的立方体.
    #[inline]
    pub fn get(&self) -> Option<&Array3<T>> {
        match self {
            Self::Empty => None,
            Self::Loaded(a) => Some(a),
        }
    }

    /// 是否已填充.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

impl<T: Clone + num::Zero> CubeSlot<T> {
    /// 取得立方体, 首次使用时按 `shape` 分配.
    pub(crate) fn get_or_alloc(&mut self, shape: [usize; 3]) -> &mut Array3<T> {
        if let Self::Empty = self {
            *self = Self::Loaded(Array3::zeros(shape));
        }
        match self {
            Self::Loaded(a) => a,
            // 上面已经分配.
            Self::Empty => unreachable!(),
        }
    }
}

/// 一次数据立方体载入的结果.
#[derive(Clone, Debug, PartialEq)]
pub struct DataLoad {
    /// 数据集属性.
    pub attrs: Attrs,
    /// 存储块形状 (存储轴序).
    pub chunk_shape: [usize; 3],
    /// 存储数据集形状 (存储轴序).
    pub shape: [usize; 3],
    /// 整个立方体的均值.
    pub mean: f64,
    /// 整个立方体的标准差.
    pub std: f64,
}

/// 存储的寻址方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StorageLayout {
    /// 存储是否行优先.
    pub c_order: bool,

    /// 块坐标是否以体中心为原点.
    pub origin_centered: bool,
}

/// 当前块的原始数据, 辅助数据与分割标签立方体.
#[derive(Clone, Debug)]
pub struct CubeStore {
    geom: Geometry,
    layout: StorageLayout,
    data: CubeSlot<f32>,
    aug: Vec<CubeSlot<f32>>,
    seg: CubeSlot<u32>,
}

impl CubeStore {
    /// 创建空的立方体存储, `naug` 为辅助数据集个数.
    pub fn new(geom: Geometry, layout: StorageLayout, naug: usize) -> Self {
        Self {
            geom,
            layout,
            data: CubeSlot::Empty,
            aug: vec![CubeSlot::Empty; naug],
            seg: CubeSlot::Empty,
        }
    }

    /// 规范轴序的原始数据立方体.
    #[inline]
    pub fn data(&self) -> EmResult<&Array3<f32>> {
        self.data.get().ok_or(EmError::NotInitialized)
    }

    /// 第 `i` 个辅助数据立方体.
    #[inline]
    pub fn aug(&self, i: usize) -> EmResult<&Array3<f32>> {
        self.aug
            .get(i)
            .and_then(CubeSlot::get)
            .ok_or(EmError::NotInitialized)
    }

    /// 辅助数据集个数.
    #[inline]
    pub fn naug(&self) -> usize {
        self.aug.len()
    }

    /// 规范轴序的分割标签立方体. 无标签模式下为 `None`.
    #[inline]
    pub fn seg(&self) -> Option<&Array3<u32>> {
        self.seg.get()
    }

    /// 存储寻址方式.
    #[inline]
    pub fn layout(&self) -> StorageLayout {
        self.layout
    }

    /// 载入原始数据立方体.
    pub fn load_data<S: VolumeStore + ?Sized>(
        &mut self,
        store: &S,
        dataset: &str,
        rand: ChunkPos,
        tiled: Option<ChunkPos>,
    ) -> EmResult<DataLoad> {
        fill_data(
            &self.geom,
            self.layout,
            &mut self.data,
            store,
            dataset,
            rand,
            tiled,
        )
    }

    /// 载入第 `i` 个辅助数据立方体.
    pub fn load_aug<S: VolumeStore + ?Sized>(
        &mut self,
        i: usize,
        store: &S,
        dataset: &str,
        rand: ChunkPos,
        tiled: Option<ChunkPos>,
    ) -> EmResult<DataLoad> {
        let slot = self.aug.get_mut(i).ok_or(EmError::NotInitialized)?;
        fill_data(&self.geom, self.layout, slot, store, dataset, rand, tiled)
    }

    /// 载入分割标签立方体, 返回标签数据集属性.
    ///
    /// 标签数据集的块形状必须与 `data_chunks` 相同. `no_labels` 为真时不分配也不读取,
    /// 但仍然检查块形状.
    pub fn load_labels<S: VolumeStore + ?Sized>(
        &mut self,
        store: &S,
        dataset: &str,
        rand: ChunkPos,
        tiled: Option<ChunkPos>,
        no_labels: bool,
        data_chunks: [usize; 3],
    ) -> EmResult<Attrs> {
        let info = store.info(dataset)?;
        if info.chunks != data_chunks {
            return Err(StoreError::ChunkMismatch {
                data: data_chunks,
                labels: info.chunks,
            }
            .into());
        }
        let attrs = store.attrs(dataset)?;
        if no_labels {
            return Ok(attrs);
        }

        let g = &self.geom;
        let layout = self.layout;
        let cube = self.seg.get_or_alloc(g.seg_labels_slice_size);
        for (pos, is_tiled) in regions(rand, tiled) {
            let begin = begin_of(&info, pos, layout);
            let src = g.label_region(begin, is_tiled).to_storage(layout.c_order);
            let dst = storage_dst(g, layout, cube.view_mut(), is_tiled);
            store.read_labels(dataset, &src, dst)?;
        }
        Ok(attrs)
    }
}

/// 随机区总是读取; 平铺区只在配置了时读取.
fn regions(rand: ChunkPos, tiled: Option<ChunkPos>) -> impl Iterator<Item = (ChunkPos, bool)> {
    std::iter::once((rand, false)).chain(tiled.map(|t| (t, true)))
}

#[inline]
fn begin_of(info: &DatasetInfo, pos: ChunkPos, layout: StorageLayout) -> [i64; 3] {
    hdf_index_from_chunk_index(
        info.shape,
        info.chunks,
        pos.chunk,
        pos.offset,
        layout.origin_centered,
        layout.c_order,
    )
}

/// 把规范轴序立方体转换为存储轴序视图, 并切出随机区或平铺区的 z 范围.
fn storage_dst<'a, T>(
    g: &Geometry,
    layout: StorageLayout,
    cube: ArrayViewMut3<'a, T>,
    tiled: bool,
) -> ArrayViewMut3<'a, T> {
    let axes = g.ordering.storage_axes(layout.c_order);
    let perm = g.ordering.perm();
    // 规范 z 轴在存储视图中的位置.
    let z_axis = if layout.c_order {
        perm[2]
    } else {
        2 - perm[2]
    };
    debug_assert_eq!(axes[z_axis], 2);
    let mut view = cube.permuted_axes(axes);
    view.slice_axis_inplace(Axis(z_axis), Slice::from(g.dst_z_range(tiled)));
    view
}

fn fill_data<S: VolumeStore + ?Sized>(
    g: &Geometry,
    layout: StorageLayout,
    slot: &mut CubeSlot<f32>,
    store: &S,
    dataset: &str,
    rand: ChunkPos,
    tiled: Option<ChunkPos>,
) -> EmResult<DataLoad> {
    let info = store.info(dataset)?;
    let cube = slot.get_or_alloc(g.data_slice_size);
    for (pos, is_tiled) in regions(rand, tiled) {
        let begin = begin_of(&info, pos, layout);
        let src = g.data_region(begin, is_tiled).to_storage(layout.c_order);
        let dst = storage_dst(g, layout, cube.view_mut(), is_tiled);
        store.read_data(dataset, &src, dst)?;
    }
    let (mean, std) = mean_std(cube);
    Ok(DataLoad {
        attrs: store.attrs(dataset)?,
        chunk_shape: info.chunks,
        shape: info.shape,
        mean,
        std,
    })
}

/// 以双精度计算总体均值与标准差.
pub(crate) fn mean_std<T: ToPrimitive + Copy>(a: &Array3<T>) -> (f64, f64) {
    let a = a.mapv(|v| v.to_f64().unwrap_or_default());
    match a.mean() {
        Some(mean) => (mean, a.std(0.)),
        None => (0.0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParserConfig;
    use crate::geometry::DimOrdering;
    use crate::store::MemStore;

    /// 原始轴序下体素 `(x, y, z)` 的取值.
    fn voxel(x: usize, y: usize, z: usize) -> f32 {
        (x * 10_000 + y * 100 + z) as f32
    }

    fn store(c_order: bool) -> MemStore {
        let native = Array3::from_shape_fn((32, 32, 32), |(x, y, z)| voxel(x, y, z));
        let labels = native.mapv(|v| v as u32);
        let (native, labels) = if c_order {
            (native, labels)
        } else {
            (
                native.reversed_axes().as_standard_layout().into_owned(),
                labels.reversed_axes().as_standard_layout().into_owned(),
            )
        };
        let mut st = MemStore::new();
        st.insert_data("data", native, [16, 16, 16]).unwrap();
        st.insert_labels("labels", labels, [16, 16, 16]).unwrap();
        st
    }

    fn geom(ordering: DimOrdering) -> Geometry {
        let cfg = ParserConfig {
            image_size: 5,
            tile_size: [4, 4, 1],
            size_rand: [8, 8, 4],
            nz_tiled: 4,
            nzslices: 3,
            dim_ordering: ordering,
            ..Default::default()
        };
        Geometry::new(&cfg, 0).unwrap()
    }

    /// 任意轴序与存储布局下, 规范立方体中的体素与原始坐标一一对应.
    #[test]
    fn test_load_reorders_consistently() {
        for c_order in [true, false] {
            for ordering in [DimOrdering::Xyz, DimOrdering::Xzy, DimOrdering::Zyx] {
                let g = geom(ordering);
                let st = store(c_order);
                let layout = StorageLayout {
                    c_order,
                    origin_centered: false,
                };
                let mut cubes = CubeStore::new(g.clone(), layout, 0);
                let rand = ChunkPos::new([0, 0, 0], [8, 8, 8]);
                let tiled = ChunkPos::new([1, 1, 1], [0, 0, 0]);
                let load = cubes.load_data(&st, "data", rand, Some(tiled)).unwrap();
                assert!(load.std > 0.0);

                let cube = cubes.data().unwrap();
                assert_eq!(cube.shape(), &g.data_slice_size);
                let half = g.image_size / 2;
                let zh = g.nzslices / 2;
                // 规范坐标 (i, j, k) 对应原始坐标 perm 逆变换.
                let check = |i: usize, j: usize, k: usize, base: [usize; 3]| {
                    let canon = [i as i64 - half as i64, j as i64 - half as i64, k as i64 - zh as i64];
                    let native = ordering.apply(canon);
                    let p = [0, 1, 2].map(|d| (base[d] as i64 + native[d]) as usize);
                    assert_eq!(cube[(i, j, k)], voxel(p[0], p[1], p[2]));
                };
                let last = (
                    g.data_slice_size[0] - 1,
                    g.data_slice_size[1] - 1,
                    g.nrand_zslice - 1,
                );
                for &(i, j, k) in &[(0, 0, 0), (3, 5, 2), last] {
                    check(i, j, k, [8, 8, 8]);
                }
                // 平铺区紧接随机区.
                let nr = g.nrand_zslice;
                for &(i, j, k) in &[(0, 0, 0), (5, 2, 4)] {
                    let canon =
                        [i as i64 - half as i64, j as i64 - half as i64, k as i64 - zh as i64];
                    let native = ordering.apply(canon);
                    let p = [0, 1, 2].map(|d| (16 + native[d]) as usize);
                    assert_eq!(cube[(i, j, nr + k)], voxel(p[0], p[1], p[2]));
                }

                // 再次载入不重新分配.
                let ptr = cubes.data().unwrap().as_ptr();
                cubes.load_data(&st, "data", rand, Some(tiled)).unwrap();
                assert_eq!(cubes.data().unwrap().as_ptr(), ptr);
            }
        }
    }

    #[test]
    fn test_load_labels() {
        let g = geom(DimOrdering::Xyz);
        let st = store(true);
        let layout = StorageLayout {
            c_order: true,
            origin_centered: false,
        };
        let mut cubes = CubeStore::new(g.clone(), layout, 0);
        let rand = ChunkPos::new([0, 0, 0], [8, 8, 8]);
        cubes
            .load_labels(&st, "labels", rand, None, false, [16, 16, 16])
            .unwrap();
        let seg = cubes.seg().unwrap();
        assert_eq!(seg.shape(), &g.seg_labels_slice_size);
        // z 方向有 nzslices / 2 的边缘.
        assert_eq!(seg[(0, 0, 1)], voxel(8, 8, 8) as u32);

        let mut quiet = CubeStore::new(g, layout, 0);
        quiet
            .load_labels(&st, "labels", rand, None, true, [16, 16, 16])
            .unwrap();
        assert!(quiet.seg().is_none());
        assert!(matches!(
            quiet.load_labels(&st, "labels", rand, None, true, [8, 8, 8]),
            Err(EmError::Store(StoreError::ChunkMismatch { .. }))
        ));
    }

    /// 读取越界是致命错误.
    #[test]
    fn test_out_of_bounds() {
        let g = geom(DimOrdering::Xyz);
        let st = store(true);
        let layout = StorageLayout {
            c_order: true,
            origin_centered: false,
        };
        let mut cubes = CubeStore::new(g, layout, 0);
        let rand = ChunkPos::new([0, 0, 0], [0, 0, 0]);
        assert!(matches!(
            cubes.load_data(&st, "data", rand, None),
            Err(EmError::Store(StoreError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn test_mean_std() {
        let a = Array3::from_shape_vec((2, 1, 2), vec![1.0f32, 3.0, 1.0, 3.0]).unwrap();
        let (m, s) = mean_std(&a);
        assert!((m - 2.0).abs() < 1e-12);
        assert!((s - 1.0).abs() < 1e-12);
        assert_eq!(mean_std(&Array3::<u32>::zeros((0, 2, 2))), (0.0, 0.0));
    }
}
