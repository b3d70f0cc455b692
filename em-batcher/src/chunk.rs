//! 多块流式读取.
//!
//! 块列表模式下, 随机批次在随机可用块之间切换, 平铺批次按批次编号遍历平铺可用块.
//! 只有块真正变化时才重新缓冲.

use crate::config::{ConfigError, ParserConfig};
use crate::cube::ChunkPos;
use crate::error::{EmError, EmResult};
use log::debug;
use rand::Rng;

/// 块区间: `[beg, beg + extent)` 内的所有块共用同一偏移.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    /// 起始块.
    pub beg: [i64; 3],
    /// 各维块数.
    pub extent: [usize; 3],
    /// 块内偏移.
    pub offset: [usize; 3],
}

impl ChunkRange {
    /// 区间内的块数.
    #[inline]
    pub fn len(&self) -> usize {
        self.extent.iter().product()
    }

    /// 区间是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 区间内第 `i` 个块, 行优先展开.
    fn unravel(&self, i: usize) -> [i64; 3] {
        let [_, e1, e2] = self.extent;
        let idx = [i / (e1 * e2), i / e2 % e1, i % e2];
        [0, 1, 2].map(|d| self.beg[d] + idx[d] as i64)
    }
}

/// 块来源.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkSource {
    /// 显式块列表, 每项有自己的偏移.
    List(Vec<ChunkPos>),

    /// 块区间列表.
    Ranges {
        /// 各区间.
        ranges: Vec<ChunkRange>,
        /// 各区间起始处的累计块数, 首项为 0.
        cumsize: Vec<usize>,
    },
}

impl ChunkSource {
    /// 可寻址的块总数.
    pub fn nchunks(&self) -> usize {
        match self {
            Self::List(v) => v.len(),
            Self::Ranges { cumsize, .. } => cumsize.last().copied().unwrap_or(0),
        }
    }

    /// 把展开后的块编号解析为块坐标与偏移.
    pub fn resolve(&self, flat: usize) -> EmResult<ChunkPos> {
        let len = self.nchunks();
        if flat >= len {
            return Err(EmError::ChunkOutOfRange { chunk: flat, len });
        }
        Ok(match self {
            Self::List(v) => v[flat],
            Self::Ranges { ranges, cumsize } => {
                // 最后一个起点不超过 flat 的区间. 空区间与后继共用起点, 因而不会被选中.
                let r = cumsize.partition_point(|&c| c <= flat) - 1;
                let range = &ranges[r];
                ChunkPos::new(range.unravel(flat - cumsize[r]), range.offset)
            }
        })
    }

    /// 是否为块区间模式.
    #[inline]
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Ranges { .. })
    }
}

/// 块列表配置.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 块来源.
    pub source: ChunkSource,
    /// 随机批次可用的块编号.
    pub rand_list: Vec<usize>,
    /// 平铺批次可用的块编号.
    pub tiled_list: Vec<usize>,
    /// 随机挑选 (真) 或轮询 (假).
    pub random: bool,
}

impl ChunkConfig {
    /// 从配置构造. 不处于块列表模式时返回 `None`.
    pub fn from_config(cfg: &ParserConfig) -> Result<Option<Self>, ConfigError> {
        if !cfg.uses_chunk_list() {
            return Ok(None);
        }
        let n = cfg.chunk_range_beg.len();
        let offsets = if cfg.offset_list.is_empty() {
            vec![[0; 3]; n]
        } else if cfg.offset_list.len() == n {
            cfg.offset_list.clone()
        } else {
            return Err(ConfigError::ChunkList(format!(
                "{} offsets for {n} entries",
                cfg.offset_list.len()
            )));
        };

        let source = if cfg.chunk_range_end.is_empty() {
            ChunkSource::List(
                cfg.chunk_range_beg
                    .iter()
                    .zip(&offsets)
                    .map(|(&c, &o)| ChunkPos::new(c, o))
                    .collect(),
            )
        } else {
            if cfg.chunk_range_end.len() != n {
                return Err(ConfigError::ChunkList(format!(
                    "{} range ends for {n} range begins",
                    cfg.chunk_range_end.len()
                )));
            }
            let mut ranges = Vec::with_capacity(n);
            for ((&beg, &end), &offset) in cfg.chunk_range_beg.iter().zip(&cfg.chunk_range_end).zip(&offsets) {
                if (0..3).any(|d| end[d] < beg[d]) {
                    return Err(ConfigError::ChunkList(format!(
                        "range {beg:?}..{end:?} is reversed"
                    )));
                }
                let extent = [0, 1, 2].map(|d| (end[d] - beg[d]) as usize);
                ranges.push(ChunkRange { beg, extent, offset });
            }
            let cumsize = std::iter::once(0)
                .chain(ranges.iter().scan(0, |acc, r| {
                    *acc += r.len();
                    Some(*acc)
                }))
                .collect();
            ChunkSource::Ranges { ranges, cumsize }
        };

        let nchunks = source.nchunks();
        let nrand = cfg.chunk_range_rand.unwrap_or(nchunks);
        if nrand > nchunks {
            return Err(ConfigError::ChunkList(format!(
                "chunk_range_rand {nrand} exceeds {nchunks} chunks"
            )));
        }
        if let Some(&bad) = cfg.chunk_skip_list.iter().find(|&&i| i >= nchunks) {
            return Err(ConfigError::ChunkList(format!(
                "skipped chunk {bad} exceeds {nchunks} chunks"
            )));
        }

        let (rand_list, mut tiled_list): (Vec<usize>, Vec<usize>) = if cfg.chunk_skip_list.is_empty() {
            ((0..nrand).collect(), (nrand..nchunks).collect())
        } else {
            (0..nchunks).partition(|i| *i < nrand && !cfg.chunk_skip_list.contains(i))
        };
        if !cfg.chunk_skip_is_test {
            tiled_list = (0..nchunks).collect();
        }

        Ok(Some(Self {
            source,
            rand_list,
            tiled_list,
            random: cfg.chunk_list_rand,
        }))
    }
}

/// 所用的块编号列表.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkList {
    /// 随机批次可用块.
    Rand,
    /// 平铺批次可用块.
    Tiled,
}

/// 块流状态.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum StreamState {
    /// 从未载入.
    #[default]
    Idle,

    /// 已载入 `current`. 输出写出滞后一步, 写往 `previous`.
    /// 首次载入时没有真正的上一块, `previous` 取 `current`.
    Loaded {
        /// 当前块.
        current: ChunkPos,
        /// 上一块.
        previous: ChunkPos,
    },
}

impl StreamState {
    /// 转移到 `next`, 返回是否需要重新缓冲.
    pub fn transition(&mut self, next: ChunkPos) -> bool {
        match *self {
            Self::Loaded { current, .. } if current == next => false,
            Self::Loaded { current, .. } => {
                *self = Self::Loaded {
                    current: next,
                    previous: current,
                };
                true
            }
            Self::Idle => {
                *self = Self::Loaded {
                    current: next,
                    previous: next,
                };
                true
            }
        }
    }

    /// 当前块.
    #[inline]
    pub fn current(&self) -> Option<ChunkPos> {
        match self {
            Self::Idle => None,
            Self::Loaded { current, .. } => Some(*current),
        }
    }

    /// 上一块.
    #[inline]
    pub fn previous(&self) -> Option<ChunkPos> {
        match self {
            Self::Idle => None,
            Self::Loaded { previous, .. } => Some(*previous),
        }
    }

    /// 上一块的输出已写出: 之后的写出目标为当前块.
    pub fn settle(&mut self) {
        if let Self::Loaded { current, previous } = self {
            *previous = *current;
        }
    }
}

/// 块流控制器.
#[derive(Clone, Debug)]
pub struct ChunkStream {
    cfg: ChunkConfig,
    state: StreamState,
    cursor: Option<usize>,
}

impl ChunkStream {
    /// 以 `Idle` 状态创建.
    pub fn new(cfg: ChunkConfig) -> Self {
        Self {
            cfg,
            state: StreamState::Idle,
            cursor: None,
        }
    }

    /// 配置.
    #[inline]
    pub fn config(&self) -> &ChunkConfig {
        &self.cfg
    }

    /// 当前状态.
    #[inline]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// 写出输出后调用, 见 [`StreamState::settle`].
    #[inline]
    pub fn settle(&mut self) {
        self.state.settle();
    }

    /// 首个块 (展开编号 0), 用于初始缓冲.
    pub fn start(&mut self) -> EmResult<ChunkPos> {
        let pos = self.cfg.source.resolve(0)?;
        self.state.transition(pos);
        Ok(pos)
    }

    /// 选择 `list` 中第 `candidate` 项对应的块, 返回新块以及是否需要重新缓冲.
    pub fn select(&mut self, candidate: usize, list: ChunkList) -> EmResult<(ChunkPos, bool)> {
        let l = match list {
            ChunkList::Rand => &self.cfg.rand_list,
            ChunkList::Tiled => &self.cfg.tiled_list,
        };
        let flat = *l.get(candidate).ok_or(EmError::ChunkOutOfRange {
            chunk: candidate,
            len: l.len(),
        })?;
        let pos = self.cfg.source.resolve(flat)?;
        let reload = self.state.transition(pos);
        if reload {
            debug!("switching to chunk {:?} offset {:?}", pos.chunk, pos.offset);
        }
        Ok((pos, reload))
    }

    /// 随机批次的下一个候选项: 随机挑选, 或在随机可用列表中轮询.
    pub fn next_rand_candidate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> EmResult<usize> {
        let n = self.cfg.rand_list.len();
        if n == 0 {
            return Err(EmError::NoRandChunks);
        }
        let next = if self.cfg.random {
            rng.gen_range(0..n)
        } else {
            self.cursor.map_or(0, |c| (c + 1) % n)
        };
        self.cursor = Some(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn list_cfg() -> ParserConfig {
        ParserConfig {
            chunk_range_beg: vec![[0, 0, 0], [1, 0, 0], [2, 0, 0], [3, 0, 0]],
            offset_list: vec![[0, 0, 0], [0, 0, 8], [0, 0, 0], [0, 0, 0]],
            ..Default::default()
        }
    }

    #[test]
    fn test_lists() {
        let c = ChunkConfig::from_config(&list_cfg()).unwrap().unwrap();
        assert_eq!(c.rand_list, vec![0, 1, 2, 3]);
        assert_eq!(c.tiled_list, vec![0, 1, 2, 3]);

        let cfg = ParserConfig {
            chunk_range_rand: Some(3),
            chunk_skip_list: vec![1],
            chunk_skip_is_test: true,
            ..list_cfg()
        };
        let c = ChunkConfig::from_config(&cfg).unwrap().unwrap();
        assert_eq!(c.rand_list, vec![0, 2]);
        assert_eq!(c.tiled_list, vec![1, 3]);

        let cfg = ParserConfig {
            chunk_range_rand: Some(3),
            chunk_skip_is_test: true,
            ..list_cfg()
        };
        let c = ChunkConfig::from_config(&cfg).unwrap().unwrap();
        assert_eq!(c.rand_list, vec![0, 1, 2]);
        assert_eq!(c.tiled_list, vec![3]);

        assert!(ChunkConfig::from_config(&ParserConfig::default())
            .unwrap()
            .is_none());
        let bad = ParserConfig {
            chunk_range_rand: Some(5),
            ..list_cfg()
        };
        assert!(ChunkConfig::from_config(&bad).is_err());
    }

    #[test]
    fn test_range_resolution() {
        let cfg = ParserConfig {
            chunk_range_beg: vec![[0, 0, 0], [10, 10, 10]],
            chunk_range_end: vec![[2, 2, 1], [11, 11, 13]],
            offset_list: vec![[0, 0, 0], [4, 4, 4]],
            ..Default::default()
        };
        let c = ChunkConfig::from_config(&cfg).unwrap().unwrap();
        assert_eq!(c.source.nchunks(), 7);
        assert_eq!(c.source.resolve(0).unwrap().chunk, [0, 0, 0]);
        assert_eq!(c.source.resolve(1).unwrap().chunk, [0, 1, 0]);
        assert_eq!(c.source.resolve(2).unwrap().chunk, [1, 0, 0]);
        let p = c.source.resolve(6).unwrap();
        assert_eq!(p, ChunkPos::new([10, 10, 12], [4, 4, 4]));
        assert!(matches!(
            c.source.resolve(7),
            Err(EmError::ChunkOutOfRange { chunk: 7, len: 7 })
        ));
    }

    /// 同一块连续选择两次只触发一次重新缓冲.
    #[test]
    fn test_select_reloads_once() {
        let c = ChunkConfig::from_config(&list_cfg()).unwrap().unwrap();
        let mut s = ChunkStream::new(c);
        assert_eq!(s.state(), StreamState::Idle);
        let first = s.start().unwrap();
        assert_eq!(
            s.state(),
            StreamState::Loaded {
                current: first,
                previous: first
            }
        );
        assert!(!s.select(0, ChunkList::Rand).unwrap().1);

        let (p, reload) = s.select(2, ChunkList::Rand).unwrap();
        assert!(reload);
        assert!(!s.select(2, ChunkList::Rand).unwrap().1);
        assert_eq!(s.state().current(), Some(p));
        assert_eq!(s.state().previous(), Some(first));
        assert!(s.select(9, ChunkList::Tiled).is_err());

        s.settle();
        assert_eq!(s.state().previous(), Some(p));
    }

    /// 同一块坐标但偏移不同也算换块.
    #[test]
    fn test_offset_change_reloads() {
        let cfg = ParserConfig {
            chunk_range_beg: vec![[0, 0, 0], [0, 0, 0]],
            offset_list: vec![[0, 0, 0], [0, 0, 8]],
            ..Default::default()
        };
        let mut s = ChunkStream::new(ChunkConfig::from_config(&cfg).unwrap().unwrap());
        s.start().unwrap();
        assert!(s.select(1, ChunkList::Rand).unwrap().1);
    }

    #[test]
    fn test_round_robin_and_random() {
        let c = ChunkConfig::from_config(&list_cfg()).unwrap().unwrap();
        let mut s = ChunkStream::new(c);
        let mut rng = StdRng::seed_from_u64(1);
        let seq: Vec<usize> = (0..6)
            .map(|_| s.next_rand_candidate(&mut rng).unwrap())
            .collect();
        assert_eq!(seq, vec![0, 1, 2, 3, 0, 1]);

        let cfg = ParserConfig {
            chunk_list_rand: true,
            ..list_cfg()
        };
        let mut s = ChunkStream::new(ChunkConfig::from_config(&cfg).unwrap().unwrap());
        for _ in 0..50 {
            assert!(s.next_rand_candidate(&mut rng).unwrap() < 4);
        }

        let cfg = ParserConfig {
            chunk_range_rand: Some(0),
            ..list_cfg()
        };
        let mut s = ChunkStream::new(ChunkConfig::from_config(&cfg).unwrap().unwrap());
        assert!(matches!(
            s.next_rand_candidate(&mut rng),
            Err(EmError::NoRandChunks)
        ));
    }
}
