//! 重切片 (reslice) 轴序.

use crate::config::ConfigError;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 内存中立方体的规范轴序, 由原始 (存储) 轴序经三种固定置换之一得到.
///
/// 仅提供三种置换, 因为数据增强本身可以转置每个 z 切片的前两维.
/// 这三种置换都是自逆的: 对任意 3 维向量, 同一置换作用两次即还原.
/// 因此 "原始 -> 规范" 与 "规范 -> 原始" 使用同一张置换表.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum DimOrdering {
    /// 恒等.
    #[default]
    Xyz,

    /// 交换后两维.
    Xzy,

    /// 逆序.
    Zyx,
}

impl DimOrdering {
    /// 置换表. 规范轴 `i` 对应原始轴 `perm()[i]`.
    #[inline]
    pub const fn perm(&self) -> [usize; 3] {
        match self {
            Self::Xyz => [0, 1, 2],
            Self::Xzy => [0, 2, 1],
            Self::Zyx => [2, 1, 0],
        }
    }

    /// 对 3 维向量实施置换. 由于置换自逆, 该操作也是自身的逆操作.
    #[inline]
    pub fn apply<T: Copy>(&self, v: [T; 3]) -> [T; 3] {
        let p = self.perm();
        [v[p[0]], v[p[1]], v[p[2]]]
    }

    /// 从规范轴序立方体得到存储轴序视图所需的 `permuted_axes` 参数.
    ///
    /// `c_order` 为 `false` 时存储按列优先声明 (形状为原始形状的逆序),
    /// 此时还要在置换之外再做一次逆序.
    #[inline]
    pub fn storage_axes(&self, c_order: bool) -> [usize; 3] {
        let p = self.perm();
        if c_order {
            p
        } else {
            [p[2], p[1], p[0]]
        }
    }

    /// 配置文件中使用的名称.
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Xyz => "xyz",
            Self::Xzy => "xzy",
            Self::Zyx => "zyx",
        }
    }
}

impl FromStr for DimOrdering {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xyz" => Ok(Self::Xyz),
            "xzy" => Ok(Self::Xzy),
            "zyx" => Ok(Self::Zyx),
            other => Err(ConfigError::UnknownName {
                what: "dim_ordering",
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DimOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::DimOrdering;
    use ndarray::Array3;

    const ALL: [DimOrdering; 3] = [DimOrdering::Xyz, DimOrdering::Xzy, DimOrdering::Zyx];

    /// 三种置换都是自逆的.
    #[test]
    fn test_apply_twice_is_identity() {
        for o in ALL {
            for v in [[1, 2, 3], [7, 7, 0], [0, 65535, 9], [-4, 5, -6]] {
                assert_eq!(o.apply(o.apply(v)), v);
            }
        }
    }

    #[test]
    fn test_apply_values() {
        assert_eq!(DimOrdering::Xyz.apply([10, 20, 30]), [10, 20, 30]);
        assert_eq!(DimOrdering::Xzy.apply([10, 20, 30]), [10, 30, 20]);
        assert_eq!(DimOrdering::Zyx.apply([10, 20, 30]), [30, 20, 10]);
    }

    #[test]
    fn test_parse() {
        assert_eq!("xzy".parse::<DimOrdering>().unwrap(), DimOrdering::Xzy);
        assert!("yxz".parse::<DimOrdering>().is_err());
        for o in ALL {
            assert_eq!(o.name().parse::<DimOrdering>().unwrap(), o);
        }
    }

    /// 存储视图的形状恰是存储声明的形状.
    #[test]
    fn test_storage_axes_shape() {
        let native = [4usize, 5, 6];
        for o in ALL {
            let canonical = o.apply(native);
            let cube = Array3::<u8>::zeros(canonical);
            let c = cube.view().permuted_axes(o.storage_axes(true));
            assert_eq!(c.shape(), &native);
            let f = cube.view().permuted_axes(o.storage_axes(false));
            assert_eq!(f.shape(), &[6, 5, 4]);
        }
    }
}
