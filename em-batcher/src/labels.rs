//! 标签方案.
//!
//! 选择标签 (selection label) 只用于按先验平衡采样; 独立标签 (independent label)
//! 是送给网络的逐像素二元目标. 标签互斥时, 选择标签本身就是网络目标.
//!
//! 方案在构造 [`LabelSetup`] 时一次性确定, 之后不再按名称分支.

use crate::config::{ConfigError, ParserConfig};
use crate::consts::label::{ECS_LABEL, EMPTY_LABEL};
use crate::Idx3d;
use ndarray::{s, Array3, ArrayView2, ArrayView3, ArrayViewMut1, Zip};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 未标注体素的选择标签, 不会进入任何查找表.
pub const UNSELECTABLE: u8 = u8::MAX;

/// 选择方案中各类别的取值. OUT/MEM 恒为 0.
#[derive(Copy, Clone, Debug)]
struct Classes {
    ics: u8,
    ecs: Option<u8>,
    border: Option<u8>,
}

impl Classes {
    /// ECS 优先于 BORDER, BORDER 优先于 OUT/MEM.
    #[inline]
    fn classify(&self, c: u32, ecs: u32, on_border: bool) -> u8 {
        match (self.ecs, self.border) {
            (Some(e), _) if c == ecs => e,
            (_, Some(b)) if on_border => b,
            _ if c == 0 => 0,
            _ => self.ics,
        }
    }
}

/// 选择标签方案.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum SelectScheme {
    /// `ICS_OUT`: OUT = 0, ICS = 1.
    #[default]
    IcsOut,

    /// `ICS_ECS_MEM`: MEM = 0, ICS = 1, ECS = 2.
    IcsEcsMem,

    /// `ICS_OUT_BRD`: OUT = 0, BORDER = 1, ICS = 2.
    IcsOutBrd,

    /// `ICS_ECS_MEM_BRD`: MEM = 0, BORDER = 1, ICS = 2, ECS = 3.
    IcsEcsMemBrd,
}

impl SelectScheme {
    /// 标签名称, 下标即标签取值.
    pub const fn names(&self) -> &'static [&'static str] {
        match self {
            Self::IcsOut => &["OUT", "ICS"],
            Self::IcsEcsMem => &["MEM", "ICS", "ECS"],
            Self::IcsOutBrd => &["OUT", "BORDER", "ICS"],
            Self::IcsEcsMemBrd => &["MEM", "BORDER", "ICS", "ECS"],
        }
    }

    /// 计算分段边界需要的分割标签边界宽度.
    #[inline]
    pub const fn border(&self) -> usize {
        match self {
            Self::IcsOutBrd | Self::IcsEcsMemBrd => 1,
            _ => 0,
        }
    }

    /// 配置中使用的名称.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::IcsOut => "ICS_OUT",
            Self::IcsEcsMem => "ICS_ECS_MEM",
            Self::IcsOutBrd => "ICS_OUT_BRD",
            Self::IcsEcsMemBrd => "ICS_ECS_MEM_BRD",
        }
    }
}

impl FromStr for SelectScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::IcsOut,
            Self::IcsEcsMem,
            Self::IcsOutBrd,
            Self::IcsEcsMemBrd,
        ]
        .into_iter()
        .find(|v| v.name() == s)
        .ok_or_else(|| ConfigError::UnknownName {
            what: "select_label_type",
            name: s.to_string(),
        })
    }
}

impl fmt::Display for SelectScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 独立标签方案.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum IndepScheme {
    /// `ICSorOUT`. 单像素输出时为 `[ICS, OUT]` 两路, 否则只有 `[ICS]`.
    #[default]
    IcsOrOut,

    /// `ICSorECSorMEM`.
    IcsOrEcsOrMem,

    /// `ICSorECS`. MEM 编码为全零.
    IcsOrEcs,

    /// `ICSorMEM`. ECS 编码为全零.
    IcsOrMem,

    /// `affin2`. 两个平面方向上的亲和度.
    Affin2,

    /// `affin4`. 分别针对 ICS 与 ECS 的亲和度.
    Affin4,

    /// `affin6`. 分别针对 ICS, ECS 与 MEM 的亲和度.
    Affin6,
}

impl IndepScheme {
    const ALL: [Self; 7] = [
        Self::IcsOrOut,
        Self::IcsOrEcsOrMem,
        Self::IcsOrEcs,
        Self::IcsOrMem,
        Self::Affin2,
        Self::Affin4,
        Self::Affin6,
    ];

    /// 每个输出像素的独立标签名称.
    pub const fn names(&self, image_out_size: usize) -> &'static [&'static str] {
        match self {
            Self::IcsOrOut if image_out_size == 1 => &["ICS", "OUT"],
            Self::IcsOrOut => &["ICS"],
            Self::IcsOrEcsOrMem => &["ICS", "ECS", "MEM"],
            Self::IcsOrEcs => &["ICS", "ECS"],
            Self::IcsOrMem => &["ICS", "MEM"],
            Self::Affin2 => &["DIM0POS", "DIM1POS"],
            Self::Affin4 => &["ICS_DIM0POS", "ICS_DIM1POS", "ECS_DIM0POS", "ECS_DIM1POS"],
            Self::Affin6 => &[
                "ICS_DIM0POS",
                "ICS_DIM1POS",
                "ECS_DIM0POS",
                "ECS_DIM1POS",
                "MEM_DIM0POS",
                "MEM_DIM1POS",
            ],
        }
    }

    /// 该方案是否只能用于独立标签模式.
    #[inline]
    pub const fn needs_independent(&self) -> bool {
        !matches!(self, Self::IcsOrOut | Self::IcsOrEcsOrMem)
    }

    /// 亲和度方案需要 1 个体素的分割标签边界.
    #[inline]
    pub const fn border(&self) -> usize {
        match self {
            Self::Affin2 | Self::Affin4 | Self::Affin6 => 1,
            _ => 0,
        }
    }

    /// 配置中使用的名称.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::IcsOrOut => "ICSorOUT",
            Self::IcsOrEcsOrMem => "ICSorECSorMEM",
            Self::IcsOrEcs => "ICSorECS",
            Self::IcsOrMem => "ICSorMEM",
            Self::Affin2 => "affin2",
            Self::Affin4 => "affin4",
            Self::Affin6 => "affin6",
        }
    }
}

impl FromStr for IndepScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or_else(|| ConfigError::UnknownName {
                what: "label_type",
                name: s.to_string(),
            })
    }
}

impl fmt::Display for IndepScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ECS 标签取值方式.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum EcsLabel {
    /// 固定值 [`ECS_LABEL`].
    #[default]
    Sentinel,

    /// 当前块中除 EMPTY 以外的最大分割标签. 每次换块重新计算.
    MaxLabel,

    /// 显式给定.
    Value(u32),
}

impl EcsLabel {
    /// 从配置中的整数取值解析: `-2` 为固定值, `-1` 为最大标签, 其余为显式值.
    pub fn from_config(v: i64) -> Result<Self, ConfigError> {
        match v {
            -2 => Ok(Self::Sentinel),
            -1 => Ok(Self::MaxLabel),
            v if (0..EMPTY_LABEL as i64).contains(&v) => Ok(Self::Value(v as u32)),
            v => Err(ConfigError::UnknownName {
                what: "ECS_label",
                name: v.to_string(),
            }),
        }
    }

    /// 针对当前分割标签立方体确定 ECS 取值. 全部未标注时返回 0.
    pub fn resolve(&self, seg: ArrayView3<u32>) -> u32 {
        match *self {
            Self::Sentinel => ECS_LABEL,
            Self::MaxLabel => seg
                .iter()
                .copied()
                .filter(|&v| v != EMPTY_LABEL)
                .max()
                .unwrap_or(0),
            Self::Value(v) => v,
        }
    }
}

/// 一次运行的标签方案.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSetup {
    select: SelectScheme,
    indep: IndepScheme,
    independent: bool,
    ecs: EcsLabel,
    image_out_size: usize,
    indep_names_out: Vec<String>,
    border: usize,
}

impl LabelSetup {
    /// 从配置构造, 检查方案与独立标签模式的一致性.
    pub fn new(cfg: &ParserConfig) -> Result<Self, ConfigError> {
        let select = cfg.select_label_type;
        let indep = cfg.label_type;
        if indep.needs_independent() && !cfg.independent_labels {
            return Err(ConfigError::SchemeNeedsIndependent(indep.name()));
        }
        let border = select.border().max(indep.border());
        if border > 0 && !cfg.independent_labels {
            return Err(ConfigError::BorderNeedsIndependent);
        }
        let names = indep.names(cfg.image_out_size);
        let npix = cfg.image_out_size * cfg.image_out_size;
        let indep_names_out = (0..npix)
            .flat_map(|i| names.iter().map(move |n| format!("{n}_{i}")))
            .collect();
        if let Some(p) = &cfg.label_priors {
            let expected = select.names().len();
            if p.len() != expected {
                return Err(ConfigError::PriorLength {
                    what: "label_priors",
                    got: p.len(),
                    expected,
                });
            }
        }
        Ok(Self {
            select,
            indep,
            independent: cfg.independent_labels,
            ecs: cfg.ecs_label,
            image_out_size: cfg.image_out_size,
            indep_names_out,
            border,
        })
    }

    /// 选择标签方案.
    #[inline]
    pub fn select_scheme(&self) -> SelectScheme {
        self.select
    }

    /// 独立标签方案.
    #[inline]
    pub fn indep_scheme(&self) -> IndepScheme {
        self.indep
    }

    /// 是否为独立标签.
    #[inline]
    pub fn independent(&self) -> bool {
        self.independent
    }

    /// ECS 取值方式.
    #[inline]
    pub fn ecs(&self) -> EcsLabel {
        self.ecs
    }

    /// 选择标签名称.
    #[inline]
    pub fn label_names(&self) -> &'static [&'static str] {
        self.select.names()
    }

    /// 选择标签个数.
    #[inline]
    pub fn nlabels(&self) -> usize {
        self.select.names().len()
    }

    /// 输出补丁边长.
    #[inline]
    pub fn image_out_size(&self) -> usize {
        self.image_out_size
    }

    /// 每个输出像素的独立标签名称.
    #[inline]
    pub fn indep_names(&self) -> &'static [&'static str] {
        self.indep.names(self.image_out_size)
    }

    /// 每个输出像素的独立标签个数.
    #[inline]
    pub fn n_indep(&self) -> usize {
        self.indep_names().len()
    }

    /// 网络输出的名称: 独立标签为 `"{name}_{pixel}"`, 否则为选择标签名称.
    pub fn output_names(&self) -> Vec<String> {
        if self.independent {
            self.indep_names_out.clone()
        } else {
            self.label_names().iter().map(|s| s.to_string()).collect()
        }
    }

    /// 网络每个样本的目标个数.
    #[inline]
    pub fn noutputs(&self) -> usize {
        if self.independent {
            self.indep_names_out.len()
        } else {
            1
        }
    }

    /// 分割标签立方体在平面上的对称边界宽度.
    #[inline]
    pub fn border(&self) -> usize {
        self.border
    }

    /// 各类别在当前选择方案中的取值.
    fn classes(&self) -> Classes {
        let names = self.select.names();
        let find = |n: &str| names.iter().position(|&v| v == n).map(|p| p as u8);
        Classes {
            ics: find("ICS").unwrap_or(0),
            ecs: find("ECS"),
            border: find("BORDER"),
        }
    }

    /// 带边界坐标 `(x, y, z)` 处的体素是否位于两个分段的交界.
    fn on_border(seg: &Array3<u32>, (x, y, z): Idx3d) -> bool {
        let c = seg[(x, y, z)];
        seg[(x + 1, y, z)] != c
            || seg[(x - 1, y, z)] != c
            || seg[(x, y + 1, z)] != c
            || seg[(x, y - 1, z)] != c
    }

    /// 中心区域坐标 `pos` 处体素的互斥网络目标.
    ///
    /// 未标注体素按非零分割 id 处理, 与其它分段一样得到 ICS (或 BORDER),
    /// 因此结果总小于 [`nlabels`](Self::nlabels).
    pub fn target_label(&self, seg: &Array3<u32>, ecs: u32, pos: Idx3d) -> u8 {
        let b = self.border;
        let p = (pos.0 + b, pos.1 + b, pos.2);
        self.classes()
            .classify(seg[p], ecs, b > 0 && Self::on_border(seg, p))
    }

    /// 由分割标签立方体计算选择标签立方体.
    ///
    /// `seg` 带有 `border` 宽的平面边界, `out` 的形状为去掉边界后的中心区域.
    /// 未标注体素标为 [`UNSELECTABLE`], 网络目标见 [`target_label`](Self::target_label).
    ///
    /// # 注意
    ///
    /// BORDER 判定对两个平面轴都做双向有限差分: 任一方向上相邻体素分割 id 不同即为 BORDER.
    /// BORDER 优先于 OUT/MEM, ECS 又优先于 BORDER.
    pub fn select_labels(&self, seg: &Array3<u32>, ecs: u32, out: &mut Array3<u8>) {
        let b = self.border;
        let classes = self.classes();
        debug_assert_eq!(
            (seg.dim().0 - 2 * b, seg.dim().1 - 2 * b, seg.dim().2),
            out.dim()
        );
        Zip::indexed(out).for_each(|(i, j, k), o| {
            let p = (i + b, j + b, k);
            let c = seg[p];
            *o = if c == EMPTY_LABEL {
                UNSELECTABLE
            } else {
                classes.classify(c, ecs, b > 0 && Self::on_border(seg, p))
            };
        });
    }

    /// 由一个 (已增强的) 分割标签补丁计算独立标签目标.
    ///
    /// `patch` 为 `seg_out_size * seg_out_size`, 含 `border` 宽的边界. `out` 长度为
    /// `pixels_per_out_image * n_indep`, 按 `(x, y, label)` 行优先排列, 调用前须置零.
    pub fn indep_targets(&self, patch: ArrayView2<u32>, ecs: u32, mut out: ArrayViewMut1<f32>) {
        let b = self.border;
        let n = self.n_indep();
        let ios = self.image_out_size;
        debug_assert_eq!(out.len(), ios * ios * n);
        debug_assert_eq!(patch.dim(), (ios + 2 * b, ios + 2 * b));

        for x in 0..ios {
            for y in 0..ios {
                let (px, py) = (x + b, y + b);
                let c = patch[(px, py)];
                let mut t = out.slice_mut(s![(x * ios + y) * n..(x * ios + y + 1) * n]);
                let is_ics = c > 0 && c != ecs;
                let is_ecs = c == ecs;
                let is_mem = c == 0;
                match self.indep {
                    IndepScheme::IcsOrOut => {
                        t[0] = (c > 0) as u8 as f32;
                        if n > 1 {
                            t[1] = is_mem as u8 as f32;
                        }
                    }
                    IndepScheme::IcsOrEcsOrMem => {
                        t[0] = is_ics as u8 as f32;
                        t[1] = is_ecs as u8 as f32;
                        t[2] = is_mem as u8 as f32;
                    }
                    IndepScheme::IcsOrEcs => {
                        t[0] = is_ics as u8 as f32;
                        t[1] = is_ecs as u8 as f32;
                    }
                    IndepScheme::IcsOrMem => {
                        t[0] = is_ics as u8 as f32;
                        t[1] = is_mem as u8 as f32;
                    }
                    IndepScheme::Affin2 | IndepScheme::Affin4 | IndepScheme::Affin6 => {
                        // 与 +1 邻居属于同一分段.
                        let same0 = patch[(px + 1, py)] == c;
                        let same1 = patch[(px, py + 1)] == c;
                        let (subsets, k) = match self.indep {
                            IndepScheme::Affin2 => ([c > 0, false, false], 1),
                            IndepScheme::Affin4 => ([is_ics, is_ecs, false], 2),
                            _ => ([is_ics, is_ecs, is_mem], 3),
                        };
                        for (m, &member) in subsets[..k].iter().enumerate() {
                            t[2 * m] = (member && same0) as u8 as f32;
                            t[2 * m + 1] = (member && same1) as u8 as f32;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn setup(
        select: SelectScheme,
        indep: IndepScheme,
        independent: bool,
        image_out_size: usize,
    ) -> Result<LabelSetup, ConfigError> {
        let cfg = ParserConfig {
            select_label_type: select,
            label_type: indep,
            independent_labels: independent,
            image_out_size,
            ..Default::default()
        };
        LabelSetup::new(&cfg)
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(
            "ICS_ECS_MEM_BRD".parse::<SelectScheme>().unwrap(),
            SelectScheme::IcsEcsMemBrd
        );
        assert_eq!("affin4".parse::<IndepScheme>().unwrap(), IndepScheme::Affin4);
        assert!("ICS_MEM".parse::<SelectScheme>().is_err());
        assert!("affin8".parse::<IndepScheme>().is_err());
        assert_eq!(EcsLabel::from_config(-1).unwrap(), EcsLabel::MaxLabel);
        assert_eq!(EcsLabel::from_config(7).unwrap(), EcsLabel::Value(7));
        assert!(EcsLabel::from_config(-3).is_err());
    }

    #[test]
    fn test_setup_consistency() {
        assert!(setup(SelectScheme::IcsOut, IndepScheme::Affin2, false, 1).is_err());
        assert!(setup(SelectScheme::IcsOutBrd, IndepScheme::IcsOrOut, false, 1).is_err());
        let s = setup(SelectScheme::IcsOutBrd, IndepScheme::Affin2, true, 2).unwrap();
        assert_eq!(s.border(), 1);
        assert_eq!(s.noutputs(), 8);
        assert_eq!(
            &s.output_names()[..3],
            &["DIM0POS_0", "DIM1POS_0", "DIM0POS_1"]
        );

        let s = setup(SelectScheme::IcsEcsMem, IndepScheme::IcsOrOut, false, 1).unwrap();
        assert_eq!(s.noutputs(), 1);
        assert_eq!(s.output_names(), vec!["MEM", "ICS", "ECS"]);
        assert_eq!(s.n_indep(), 2);
    }

    /// 两个分段在 x = 2 处相接, 0 号为膜.
    fn seg_cube() -> Array3<u32> {
        Array3::from_shape_fn((6, 4, 1), |(x, y, _)| match (x, y) {
            (_, 0) => 0,
            (0..=2, _) => 5,
            _ => 9,
        })
    }

    #[test]
    fn test_select_plain() {
        let s = setup(SelectScheme::IcsEcsMem, IndepScheme::IcsOrOut, false, 1).unwrap();
        let mut seg = seg_cube();
        seg[(5, 3, 0)] = EMPTY_LABEL;
        let mut out = Array3::<u8>::zeros((6, 4, 1));
        s.select_labels(&seg, 9, &mut out);
        assert_eq!(out[(0, 0, 0)], 0); // MEM
        assert_eq!(out[(1, 1, 0)], 1); // ICS
        assert_eq!(out[(4, 1, 0)], 2); // ECS
        assert_eq!(out[(5, 3, 0)], UNSELECTABLE);
    }

    #[test]
    fn test_select_border() {
        let s = setup(SelectScheme::IcsEcsMemBrd, IndepScheme::Affin6, true, 1).unwrap();
        let seg = seg_cube();
        let mut out = Array3::<u8>::zeros((4, 2, 1));
        s.select_labels(&seg, 9, &mut out);
        // 中心 (i, j) 对应 seg (i + 1, j + 1).
        // seg (1, 1): 左右均为 5, 下方为 0 -> BORDER.
        assert_eq!(out[(0, 0, 0)], 1);
        // seg (2, 2): 右侧为 9 -> BORDER.
        assert_eq!(out[(1, 1, 0)], 1);
        // seg (4, 2): ECS 优先于 BORDER.
        assert_eq!(out[(3, 1, 0)], 3);
        // seg (1, 2): 四邻均为 5 -> ICS.
        assert_eq!(out[(0, 1, 0)], 2);
    }

    #[test]
    fn test_indep_targets() {
        let s = setup(SelectScheme::IcsOut, IndepScheme::IcsOrOut, true, 1).unwrap();
        let mut t = [0.0f32; 2];
        s.indep_targets(Array2::from_elem((1, 1), 4).view(), ECS_LABEL, ArrayViewMut1::from(&mut t[..]));
        assert_eq!(t, [1.0, 0.0]);
        let mut t = [0.0f32; 2];
        s.indep_targets(Array2::from_elem((1, 1), 0).view(), ECS_LABEL, ArrayViewMut1::from(&mut t[..]));
        assert_eq!(t, [0.0, 1.0]);

        let s = setup(SelectScheme::IcsOut, IndepScheme::IcsOrEcs, true, 1).unwrap();
        let mut t = [0.0f32; 2];
        s.indep_targets(Array2::from_elem((1, 1), 0).view(), 9, ArrayViewMut1::from(&mut t[..]));
        assert_eq!(t, [0.0, 0.0]);
    }

    #[test]
    fn test_affinity() {
        let s = setup(SelectScheme::IcsOut, IndepScheme::Affin4, true, 1).unwrap();
        // 中心 5, +x 邻居 5, +y 邻居 7.
        let mut p = Array2::<u32>::zeros((3, 3));
        p[(1, 1)] = 5;
        p[(2, 1)] = 5;
        p[(1, 2)] = 7;
        let mut t = [0.0f32; 4];
        s.indep_targets(p.view(), 7, ArrayViewMut1::from(&mut t[..]));
        assert_eq!(t, [1.0, 0.0, 0.0, 0.0]);

        // 中心为 ECS.
        p[(1, 1)] = 7;
        let mut t = [0.0f32; 4];
        s.indep_targets(p.view(), 7, ArrayViewMut1::from(&mut t[..]));
        assert_eq!(t, [0.0, 0.0, 0.0, 1.0]);
    }
}
